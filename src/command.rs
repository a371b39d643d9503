use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::connection::ConnectionHandle;
use crate::value::Value;

pub type HandlerFuture = Pin<Box<dyn Future<Output = crate::Result<()>> + Send>>;

/// A command handler consumes the decoded arguments plus the caller's
/// connection handle, and either writes exactly one reply and flushes it, or
/// writes nothing at all for a fire-and-forget command. A returned error
/// becomes an `ERR` reply written by the dispatcher.
pub type Handler = Arc<dyn Fn(Vec<Value>, ConnectionHandle) -> HandlerFuture + Send + Sync>;

/// Help metadata for one registered command, serialized as-is by `CMDS`.
#[derive(Clone, Debug, Serialize)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
    pub usage: String,
    pub fire_and_forget: bool,
}

impl CommandSpec {
    pub fn new(name: &str, description: &str, usage: &str, fire_and_forget: bool) -> CommandSpec {
        CommandSpec {
            name: name.to_uppercase(),
            description: description.to_string(),
            usage: usage.to_string(),
            fire_and_forget,
        }
    }
}

/// Case-insensitive command table. Populated at startup before the acceptor
/// runs; lookups during dispatch take the read lock only.
#[derive(Default)]
pub struct Registry {
    commands: RwLock<HashMap<String, Handler>>,
    help: RwLock<HashMap<String, CommandSpec>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registers a handler together with its help entry. Registering the
    /// same name again overwrites the previous entry.
    pub fn register(&self, spec: CommandSpec, handler: Handler) {
        let name = spec.name.clone();
        self.help.write().unwrap().insert(name.clone(), spec);
        self.commands.write().unwrap().insert(name, handler);
    }

    /// Registers help metadata only, for commands the dispatcher intercepts
    /// before consulting the table (`QUIT`).
    pub fn register_help(&self, spec: CommandSpec) {
        self.help.write().unwrap().insert(spec.name.clone(), spec);
    }

    pub fn lookup(&self, name: &str) -> Option<Handler> {
        self.commands
            .read()
            .unwrap()
            .get(&name.to_uppercase())
            .cloned()
    }

    /// Snapshot of the help metadata, keyed by uppercased command name.
    pub fn help(&self) -> HashMap<String, CommandSpec> {
        self.help.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Handler {
        Arc::new(|_args, _client| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = Registry::new();
        registry.register(CommandSpec::new("ping", "", "", false), noop_handler());

        assert!(registry.lookup("PING").is_some());
        assert!(registry.lookup("ping").is_some());
        assert!(registry.lookup("pInG").is_some());
        assert!(registry.lookup("PONG").is_none());
    }

    #[test]
    fn register_overwrites_existing_entry() {
        let registry = Registry::new();
        registry.register(
            CommandSpec::new("GET", "first", "", false),
            noop_handler(),
        );
        registry.register(
            CommandSpec::new("get", "second", "", false),
            noop_handler(),
        );

        let help = registry.help();
        assert_eq!(help.len(), 1);
        assert_eq!(help["GET"].description, "second");
    }

    #[test]
    fn help_only_entries_have_no_handler() {
        let registry = Registry::new();
        registry.register_help(CommandSpec::new("QUIT", "Closes the connection", "", false));

        assert!(registry.lookup("QUIT").is_none());
        assert!(registry.help().contains_key("QUIT"));
    }
}
