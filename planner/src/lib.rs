//! Front end plumbing for the deployment optimizer.

pub mod report;
