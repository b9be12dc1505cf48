mod client;
mod rate_limit;

pub use client::{
    aggregate_required_checks, classify_status, BranchUpdateOutcome, Classification, CommentPatch,
    GithubHostingClient, HostingClient, IssueMutation, MergeOutcome, MergeRequest, PrView,
};
pub use rate_limit::{RateLimitCooldowns, RateLimitInfo};
