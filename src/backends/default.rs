use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::backends::{handler, Backend};
use crate::command::CommandSpec;
use crate::connection::ConnectionHandle;
use crate::server::Server;
use crate::value::Value;

/// Introspection commands every server carries: `PING`, `ECHO`, `SUM`,
/// `INFO`, and `CMDS`, plus the help-only entry for `QUIT`.
pub struct DefaultBackend {
    server: Weak<Server>,
}

impl DefaultBackend {
    pub fn register(server: &Arc<Server>) -> Arc<DefaultBackend> {
        let backend = Arc::new(DefaultBackend {
            server: Arc::downgrade(server),
        });

        server.register_command(
            CommandSpec::new("PING", "Pings the server for a response", "", false),
            handler!(backend, ping),
        );
        server.register_command(
            CommandSpec::new("ECHO", "Echos back a message sent", "ECHO \"hello world\"", false),
            handler!(backend, echo),
        );
        server.register_command(
            CommandSpec::new("SUM", "Adds up the given numeric parameters", "SUM 10 20", false),
            handler!(backend, sum),
        );
        server.register_command(
            CommandSpec::new("INFO", "Current server status and information", "", false),
            handler!(backend, info),
        );
        server.register_command(
            CommandSpec::new(
                "CMDS",
                "List of available commands supported by the server",
                "",
                false,
            ),
            handler!(backend, cmds),
        );
        server.register_help(CommandSpec::new(
            "QUIT",
            "Closes the connection to the server",
            "",
            false,
        ));

        backend
    }

    fn server(&self) -> crate::Result<Arc<Server>> {
        self.server
            .upgrade()
            .ok_or_else(|| -> crate::Error { "server closed".into() })
    }

    async fn ping(&self, _args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        client.write_simple("PONG")?;
        client.flush().await
    }

    async fn echo(&self, mut args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        match args.len() {
            0 => client.write_simple("")?,
            1 => client.write_value(&args.remove(0))?,
            _ => client.write_value(&Value::Array(args))?,
        }
        client.flush().await
    }

    async fn sum(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.len() < 2 {
            client.write_error("SUM takes at least 2 parameters")?;
            return client.flush().await;
        }

        let mut int_sum: i64 = 0;
        let mut float_sum: f64 = 0.0;
        let mut saw_float = false;
        for arg in &args {
            if let Some(n) = arg.as_i64() {
                int_sum += n;
            } else if let Some(f) = arg.as_f64() {
                float_sum += f;
                saw_float = true;
            } else {
                client.write_error("SUM takes numeric parameters")?;
                return client.flush().await;
            }
        }

        if saw_float {
            client.write_float(float_sum + int_sum as f64)?;
        } else {
            client.write_int(int_sum)?;
        }
        client.flush().await
    }

    async fn info(&self, _args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        let status = self.server()?.status();
        client.write_json(&status)?;
        client.flush().await
    }

    async fn cmds(&self, _args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        let help = self.server()?.help();
        client.write_json(&help)?;
        client.flush().await
    }
}

#[async_trait]
impl Backend for DefaultBackend {
    async fn load(&self) -> crate::Result<()> {
        Ok(())
    }

    async fn unload(&self) -> crate::Result<()> {
        Ok(())
    }
}
