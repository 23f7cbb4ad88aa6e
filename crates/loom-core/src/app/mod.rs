//! App - アプリケーション層
//!
//! ports を組み合わせて job を実行する部品。adapter（`backend`）から使われる。
//!
//! # 主要コンポーネント
//! - **Executor**: task 本体を retry 付きで実行し、hook を発火
//! - **WorkerGroup**: JobSource から job を取り出して Executor に渡す worker 群
//! - **SchedulerLoop**: 永続 schedule から job を生成（apscheduler）

pub mod executor;
pub mod scheduler;
pub mod worker;

// 主要な型を再エクスポート
pub use self::executor::{Executor, TaskTable};
pub use self::scheduler::SchedulerLoop;
pub use self::worker::{ClaimedJob, JobSource, WorkerGroup};
