//! In-process provider simulation for feedwatch.
//!
//! A scripted provider speaks the wire codec on the far side of an
//! in-memory adapter so the watchlist can be driven end to end without a
//! network.

pub mod harness;
pub mod provider;
pub mod script;

pub use harness::{HarnessError, SimHarness};
pub use provider::ScriptedProvider;
pub use script::{run_script, Script, ScriptStep};
