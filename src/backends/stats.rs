use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::backends::{handler, Backend};
use crate::command::CommandSpec;
use crate::connection::ConnectionHandle;
use crate::server::Server;
use crate::store::{self, MemoryStore};
use crate::value::Value;

/// How often accumulated counters are folded into their per-second rates.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Counter, value, and set commands over the in-memory store. `load` starts
/// the periodic counter flush; `unload` stops it.
pub struct StatsBackend {
    store: Arc<Mutex<MemoryStore>>,
    flush_stop: Mutex<Option<CancellationToken>>,
}

impl StatsBackend {
    pub fn register(server: &Arc<Server>) -> Arc<StatsBackend> {
        let backend = Arc::new(StatsBackend {
            store: Arc::new(Mutex::new(MemoryStore::new())),
            flush_stop: Mutex::new(None),
        });

        server.register_command(
            CommandSpec::new(
                "COUNT",
                "Increments a key that resets itself to 0 on each flush routine.",
                "COUNT foo [124]",
                true,
            ),
            handler!(backend, count),
        );
        server.register_command(
            CommandSpec::new("COUNTERS", "Returns the list of active counters.", "", false),
            handler!(backend, counters),
        );
        server.register_command(
            CommandSpec::new(
                "INCR",
                "Increments a key by the specified value or by default 1.",
                "INCR key [1]",
                false,
            ),
            handler!(backend, incr),
        );
        server.register_command(
            CommandSpec::new(
                "DECR",
                "Decrements a key by the specified value or by default 1.",
                "DECR key [1]",
                false,
            ),
            handler!(backend, decr),
        );
        server.register_command(
            CommandSpec::new(
                "DEL",
                "Deletes a key from the values or counters list or both.",
                "DEL key",
                false,
            ),
            handler!(backend, del),
        );
        server.register_command(
            CommandSpec::new(
                "EXISTS",
                "Determines if the given key exists from the values.",
                "EXISTS key",
                false,
            ),
            handler!(backend, exists),
        );
        server.register_command(
            CommandSpec::new("GET", "Gets the specified key from the values.", "GET key", false),
            handler!(backend, get),
        );
        server.register_command(
            CommandSpec::new(
                "SET",
                "Sets the specified key to the specified value in values.",
                "SET key 1234",
                false,
            ),
            handler!(backend, set),
        );
        server.register_command(
            CommandSpec::new(
                "SETNX",
                "Sets the specified key to the given value only if the key is not already set.",
                "SETNX key 1234",
                false,
            ),
            handler!(backend, set_nx),
        );
        server.register_command(
            CommandSpec::new(
                "KEYS",
                "Lists the value keys matching a glob pattern.",
                "KEYS user:*",
                false,
            ),
            handler!(backend, keys),
        );
        server.register_command(
            CommandSpec::new("SADD", "Adds members to a set.", "SADD key member [member ...]", false),
            handler!(backend, sadd),
        );
        server.register_command(
            CommandSpec::new(
                "SREM",
                "Removes members from a set.",
                "SREM key member [member ...]",
                false,
            ),
            handler!(backend, srem),
        );
        server.register_command(
            CommandSpec::new("SCARD", "Returns the number of members in a set.", "SCARD key", false),
            handler!(backend, scard),
        );
        server.register_command(
            CommandSpec::new("SMEMBERS", "Returns all members of a set.", "SMEMBERS key", false),
            handler!(backend, smembers),
        );

        backend
    }

    pub fn store(&self) -> Arc<Mutex<MemoryStore>> {
        self.store.clone()
    }

    async fn reply_int(&self, client: &ConnectionHandle, value: i64) -> crate::Result<()> {
        client.write_int(value)?;
        client.flush().await
    }

    async fn misuse(&self, client: &ConnectionHandle, message: &str) -> crate::Result<()> {
        client.write_error(message)?;
        client.flush().await
    }

    async fn count(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.is_empty() {
            return self
                .misuse(&client, "COUNT takes at least 1 parameter (i.e. key to increment)")
                .await;
        }
        let key = arg_str(&args, 0)?;
        let amount = opt_arg_i64(&args, 1)?.unwrap_or(1);
        self.store.lock().unwrap().counter_by(&key, amount);
        // fire-and-forget: no reply
        Ok(())
    }

    async fn counters(&self, _args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        let snapshot = self.store.lock().unwrap().counters();
        client.write_json(&snapshot)?;
        client.flush().await
    }

    async fn incr(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.is_empty() {
            return self
                .misuse(&client, "INCR takes at least 1 parameter (i.e. key to increment)")
                .await;
        }
        let key = arg_str(&args, 0)?;
        let amount = opt_arg_i64(&args, 1)?.unwrap_or(1);
        let value = self.store.lock().unwrap().incr_by(&key, amount);
        self.reply_int(&client, value).await
    }

    async fn decr(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.is_empty() {
            return self
                .misuse(&client, "DECR takes at least 1 parameter (i.e. key to decrement)")
                .await;
        }
        let key = arg_str(&args, 0)?;
        let amount = opt_arg_i64(&args, 1)?.unwrap_or(1);
        let value = self.store.lock().unwrap().decr_by(&key, amount);
        self.reply_int(&client, value).await
    }

    async fn del(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.is_empty() {
            return self
                .misuse(&client, "DEL takes at least 1 parameter (i.e. key to delete)")
                .await;
        }
        let deleted = {
            let mut store = self.store.lock().unwrap();
            let mut deleted = 0;
            for arg in &args {
                if let Some(key) = arg.as_str() {
                    deleted += store.del(&key);
                }
            }
            deleted
        };
        self.reply_int(&client, deleted).await
    }

    async fn exists(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.is_empty() {
            return self
                .misuse(&client, "EXISTS takes at least 1 parameter (i.e. key to find)")
                .await;
        }
        let key = arg_str(&args, 0)?;
        let value = self.store.lock().unwrap().exists(&key);
        self.reply_int(&client, value).await
    }

    async fn get(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.is_empty() {
            return self
                .misuse(&client, "GET takes at least 1 parameter (i.e. key to get)")
                .await;
        }
        let key = arg_str(&args, 0)?;
        let value = self.store.lock().unwrap().get(&key);
        match value {
            Ok(value) => self.reply_int(&client, value).await,
            // A missing key replies null, distinct from a stored zero.
            Err(store::Error::NotFound) => {
                client.write_null()?;
                client.flush().await
            }
        }
    }

    async fn set(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.len() < 2 {
            return self
                .misuse(
                    &client,
                    "SET takes at least 2 parameters (i.e. key to set and value to set to)",
                )
                .await;
        }
        let key = arg_str(&args, 0)?;
        let value = arg_i64(&args, 1)?;
        let result = self.store.lock().unwrap().set(&key, value);
        self.reply_int(&client, result).await
    }

    async fn set_nx(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.len() < 2 {
            return self
                .misuse(
                    &client,
                    "SETNX takes at least 2 parameters (i.e. key to set and value to set to, if not already set)",
                )
                .await;
        }
        let key = arg_str(&args, 0)?;
        let value = arg_i64(&args, 1)?;
        let result = self.store.lock().unwrap().set_nx(&key, value);
        self.reply_int(&client, result).await
    }

    async fn keys(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        let pattern = if args.is_empty() {
            "*".to_string()
        } else {
            arg_str(&args, 0)?
        };
        let mut keys = self.store.lock().unwrap().keys(&pattern);
        keys.sort();
        let reply = Value::Array(keys.into_iter().map(|k| Value::Bulk(Bytes::from(k))).collect());
        client.write_value(&reply)?;
        client.flush().await
    }

    async fn sadd(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.len() < 2 {
            return self
                .misuse(&client, "SADD takes at least 2 parameters (i.e. key and members to add)")
                .await;
        }
        let key = arg_str(&args, 0)?;
        let members = member_strings(&args[1..]);
        let added = self.store.lock().unwrap().sadd(&key, members);
        self.reply_int(&client, added).await
    }

    async fn srem(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.len() < 2 {
            return self
                .misuse(
                    &client,
                    "SREM takes at least 2 parameters (i.e. key and members to remove)",
                )
                .await;
        }
        let key = arg_str(&args, 0)?;
        let members = member_strings(&args[1..]);
        let removed = self.store.lock().unwrap().srem(&key, members);
        self.reply_int(&client, removed).await
    }

    async fn scard(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.is_empty() {
            return self
                .misuse(&client, "SCARD takes at least 1 parameter (i.e. key to inspect)")
                .await;
        }
        let key = arg_str(&args, 0)?;
        let count = self.store.lock().unwrap().scard(&key);
        self.reply_int(&client, count).await
    }

    async fn smembers(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        if args.is_empty() {
            return self
                .misuse(&client, "SMEMBERS takes at least 1 parameter (i.e. key to inspect)")
                .await;
        }
        let key = arg_str(&args, 0)?;
        let mut members = self.store.lock().unwrap().smembers(&key);
        members.sort();
        let reply = Value::Array(
            members
                .into_iter()
                .map(|m| Value::Bulk(Bytes::from(m)))
                .collect(),
        );
        client.write_value(&reply)?;
        client.flush().await
    }
}

fn arg_str(args: &[Value], index: usize) -> crate::Result<String> {
    args.get(index)
        .and_then(|arg| arg.as_str())
        .map(|s| s.into_owned())
        .ok_or_else(|| "invalid parameter; expected a string".into())
}

fn arg_i64(args: &[Value], index: usize) -> crate::Result<i64> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| "invalid parameter; expected an integer".into())
}

fn opt_arg_i64(args: &[Value], index: usize) -> crate::Result<Option<i64>> {
    match args.get(index) {
        None => Ok(None),
        Some(arg) => arg
            .as_i64()
            .map(Some)
            .ok_or_else(|| "invalid parameter; expected an integer".into()),
    }
}

fn member_strings(args: &[Value]) -> Vec<String> {
    args.iter()
        .filter_map(|arg| arg.as_str())
        .map(|s| s.into_owned())
        .collect()
}

#[async_trait]
impl Backend for StatsBackend {
    async fn load(&self) -> crate::Result<()> {
        let stop = CancellationToken::new();
        *self.flush_stop.lock().unwrap() = Some(stop.clone());

        let store = self.store.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(FLUSH_INTERVAL);
            // the first tick completes immediately; skip it
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = timer.tick() => store.lock().unwrap().flush_counters(),
                }
            }
        });

        Ok(())
    }

    async fn unload(&self) -> crate::Result<()> {
        if let Some(stop) = self.flush_stop.lock().unwrap().take() {
            stop.cancel();
        }
        Ok(())
    }
}
