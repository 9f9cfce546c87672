//! Domain models for Shipline.
//!
//! - `Environment`: a named deployment target and its policy
//! - `Stage`: a node in the pipeline graph
//! - `Run`: one execution of the pipeline
//! - `ShiplineError`: the error taxonomy

pub mod environment;
pub mod error;
pub mod run;
pub mod stage;

pub use environment::{CredentialRef, Environment, TestLevel, Tier};
pub use error::{Result, ShiplineError};
pub use run::{Run, RunContext, StageState, StageStatus, TriggerEvent};
pub use stage::{Stage, StageMode, Trigger};
