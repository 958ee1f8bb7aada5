//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（永続化、通知先、下流サービス）への
//! インターフェースを提供し、実装の詳細を隠蔽します。

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod service;
pub mod state_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, SinkError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::service::{ErrorKind, ServiceAdapter, ServiceError, ServiceRequest};
pub use self::state_store::{Mutation, StateStore, StoreError};
