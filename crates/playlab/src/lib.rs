//! playlab - throwaway local analytics playground
//!
//! Downloads a data engine and a notebook environment into a uniquely named
//! working area, negotiates ports, patches the generated configs, supervises
//! both child processes, and removes everything on exit.

pub mod installer;
pub mod orchestrator;
pub mod readiness;
pub mod services;
pub mod supervisor;
