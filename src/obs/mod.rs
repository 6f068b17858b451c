//! The OBS stage: watches an upstream build repository and starts the
//! pipeline when a matching artifact appears.

mod conditions;
mod repo;
mod watchdog;

pub use conditions::{
    compare_versions, evaluate_conditions, evaluate_disallows, glob_match, parse_packages_file,
    Condition, PackageInfo,
};
pub use repo::{BuildResult, RepoError, RepoScanner};
pub use watchdog::ObsWatchdogService;
