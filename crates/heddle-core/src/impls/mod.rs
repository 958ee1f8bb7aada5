//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryStateStore**: 開発用・テスト用の正本
//! - **SqliteStateStore**: SQLite による永続化
//! - **BroadcastSink / MemorySink / TracingSink**: イベント配送先
//! - **FnAdapter / EchoAdapter**: 下流サービスのスタブ

pub mod adapters;
pub mod inmem_store;
pub mod sinks;
pub mod sqlite_store;

pub use self::adapters::{EchoAdapter, FnAdapter};
pub use self::inmem_store::InMemoryStateStore;
pub use self::sinks::{BroadcastSink, MemorySink, TracingSink};
pub use self::sqlite_store::SqliteStateStore;
