//! Runtime tunables.
//!
//! Defaults are compiled in; a config file (serde) or `SHARD_*` environment
//! variables override them. Environment wins over file, matching how the
//! node is tuned in deployment scripts.

use std::env;
use std::str::FromStr;

use serde::Deserialize;

const N_MIGRATE_THREADS: usize = 4;
const MIGRATE_RETRANSMIT_MS: u64 = 1_000;
const MIGRATE_RETRANSMIT_STARTDONE_MS: u64 = 1_000;
const MIGRATE_SLEEP_US: u64 = 0;
const MIGRATE_RX_LIFETIME_MS: u64 = 60_000;
const TRANSACTION_RETRY_MS: u64 = 1_000;
const TRANSACTION_MAX_MS: u64 = 1_000;

/// Migration tunables.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// Emigration worker pool size; live-reconfigurable.
    pub n_migrate_threads: usize,
    /// INSERT retransmit interval.
    pub retransmit_ms: u64,
    /// START/DONE retransmit interval.
    pub retransmit_startdone_ms: u64,
    /// Inter-record sleep while streaming (throttle); 0 disables.
    pub sleep_us: u64,
    /// How long a completed immigration session is retained before the
    /// reaper evicts it; 0 evicts on DONE.
    pub rx_lifetime_ms: u64,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            n_migrate_threads: N_MIGRATE_THREADS,
            retransmit_ms: MIGRATE_RETRANSMIT_MS,
            retransmit_startdone_ms: MIGRATE_RETRANSMIT_STARTDONE_MS,
            sleep_us: MIGRATE_SLEEP_US,
            rx_lifetime_ms: MIGRATE_RX_LIFETIME_MS,
        }
    }
}

/// Replicated-write tunables.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Initial repl-write retry interval; doubles per retransmit.
    pub retry_ms: u64,
    /// Default deadline when the client did not set one.
    pub max_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            retry_ms: TRANSACTION_RETRY_MS,
            max_ms: TRANSACTION_MAX_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub migrate: MigrateConfig,
    pub transaction: TransactionConfig,
}

impl Config {
    /// Compiled-in defaults with `SHARD_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        cfg.apply_env();
        cfg
    }

    pub fn apply_env(&mut self) {
        self.migrate.n_migrate_threads =
            read_env("SHARD_N_MIGRATE_THREADS", self.migrate.n_migrate_threads);
        self.migrate.retransmit_ms =
            read_env("SHARD_MIGRATE_RETRANSMIT_MS", self.migrate.retransmit_ms);
        self.migrate.retransmit_startdone_ms = read_env(
            "SHARD_MIGRATE_RETRANSMIT_STARTDONE_MS",
            self.migrate.retransmit_startdone_ms,
        );
        self.migrate.sleep_us = read_env("SHARD_MIGRATE_SLEEP_US", self.migrate.sleep_us);
        self.migrate.rx_lifetime_ms =
            read_env("SHARD_MIGRATE_RX_LIFETIME_MS", self.migrate.rx_lifetime_ms);
        self.transaction.retry_ms =
            read_env("SHARD_TRANSACTION_RETRY_MS", self.transaction.retry_ms);
        self.transaction.max_ms = read_env("SHARD_TRANSACTION_MAX_MS", self.transaction.max_ms);
    }
}

fn read_env<T: FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| T::from_str(&v).ok())
        .unwrap_or(default)
}
