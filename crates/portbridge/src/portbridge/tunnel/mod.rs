//! Workspace-side mirror of the agent's tunnel table.
//!
//! [`supervisor::StreamSupervisor`] keeps a status stream open and feeds each
//! snapshot into the shared [`table::TunnelTable`]; [`provider::TunnelProvider`]
//! serves handles out of that table and asks the agent to open ports on demand.

pub mod handle;
pub mod notifier;
pub mod provider;
pub mod supervisor;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;
