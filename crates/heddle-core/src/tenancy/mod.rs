//! Tenancy - workspace / project / RBAC
//!
//! - **rbac**: ロール → 権限の表と `require`
//! - **WorkspaceManager**: workspace とメンバー
//! - **ProjectManager**: プロジェクトとその統計

pub mod project;
pub mod rbac;
pub mod workspace;

pub use project::{ProjectManager, ProjectStats};
pub use rbac::Permission;
pub use workspace::WorkspaceManager;
