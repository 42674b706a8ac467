//! The command table.
//!
//! `register_all` builds the full static table the daemon serves. Commands
//! are grouped by namespace, one module per namespace.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::command::CommandRegistry;

pub mod event;
pub mod group;
pub mod manage;
pub mod provider;
pub mod statistics;

/// Build the complete command registry.
pub fn register_all() -> Arc<CommandRegistry> {
    // manage.list_commands and manage.help read the finished table; they get
    // a slot that is filled in once registration completes.
    let slot: Arc<OnceCell<Arc<CommandRegistry>>> = Arc::new(OnceCell::new());

    let mut registry = CommandRegistry::new();
    group::register(&mut registry);
    event::register(&mut registry);
    statistics::register(&mut registry);
    manage::register(&mut registry, slot.clone());
    provider::register(&mut registry);

    let registry = Arc::new(registry);
    let _ = slot.set(registry.clone());
    registry
}
