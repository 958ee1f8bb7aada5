//! IdGenerator port - ID 生成の抽象化
//!
//! テスト容易性のために trait として抽象化しています。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{Id, IdMarker};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散システムで使える ID を生成
///
/// # ULID の特性
/// - 時刻でソート可能
/// - 分散環境で生成可能（調整不要）
/// - 128-bit（UUID 互換）
pub trait IdGenerator: Send + Sync {
    fn next_ulid(&self) -> Ulid;
}

impl<'a> dyn IdGenerator + 'a {
    /// 型付き ID を生成（`gen.next::<Task>()`）
    pub fn next<T: IdMarker>(&self) -> Id<T> {
        Id::from_ulid(self.next_ulid())
    }
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock の時刻を timestamp 部分に使うので、FixedClock と組み合わせると
/// 時刻部分が決定的になる。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}
