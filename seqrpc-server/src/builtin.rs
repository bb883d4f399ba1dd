//! Methods served by the `seqrpc` daemon out of the box.

use crate::service::Methods;
use std::time::Duration;

pub const PING: &str = "Sys.Ping";
pub const LIST_METHODS: &str = "Sys.Methods";
pub const ECHO: &str = "Echo.Say";
pub const SUM: &str = "Arith.Sum";
pub const SLEEP: &str = "Arith.Sleep";

/// Upper bound for `Arith.Sleep`.
pub const MAX_SLEEP_MS: u64 = 60_000;

/// Builds the built-in method table.
pub fn methods() -> Methods {
    let mut methods = Methods::new();
    methods
        .register(PING, |_: ()| Ok("pong".to_string()))
        .register(ECHO, |text: String| Ok(text))
        .register(SUM, |(a, b): (i64, i64)| {
            a.checked_add(b)
                .ok_or_else(|| format!("{} + {} overflows", a, b))
        })
        .register(SLEEP, |ms: u64| {
            if ms > MAX_SLEEP_MS {
                return Err(format!("sleep of {}ms exceeds {}ms", ms, MAX_SLEEP_MS));
            }
            std::thread::sleep(Duration::from_millis(ms));
            Ok(ms)
        });

    let mut names: Vec<String> = methods.names().into_iter().map(String::from).collect();
    names.push(LIST_METHODS.to_string());
    names.sort_unstable();
    methods.register(LIST_METHODS, move |_: ()| Ok(names.clone()));
    methods
}
