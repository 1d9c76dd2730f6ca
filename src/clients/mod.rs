//! Clients for the external systems the sagas drive. Each sits behind a
//! trait so sagas take them as injected `Arc<dyn ...>` dependencies.

pub mod github;
pub mod launchpad;
pub mod lxd;

pub use github::{GitHubApi, GitHubClient, NewPullRequest, PullRequest, RegistrationToken};
pub use launchpad::{LaunchpadApi, LaunchpadClient, MergeProposal, merge_proposal_id};
pub use lxd::{ImageSource, InstanceSpec, InstanceState, LxdClient, VmHost};
