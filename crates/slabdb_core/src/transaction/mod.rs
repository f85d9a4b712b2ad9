//! Transactions over snapshots.
//!
//! A [`Transaction`] pins one committed version through the read-lock
//! registry and moves through four stages:
//!
//! ```text
//!            start_read / start_frozen          start_write
//!   Ready ─────────────────────────────► Reading ◄──────────── Writing
//!     ▲                                   │  ▲   promote_to_write  ▲
//!     │ end_read / rollback / close       │  └─────── commit ──────┘
//!     └───────────────────────────────────┘
//! ```
//!
//! `Frozen` behaves like `Reading` but never advances. Only one transaction
//! in the process can be `Writing`; it holds the database write mutex from
//! `start_write` / `promote_to_write` until `commit` or `rollback`.
//!
//! Every operation checks the stage first and fails with
//! `WrongTransactState` if it does not apply. Dropping a transaction runs
//! [`Transaction::close`].

mod commit;
mod data;
mod state;

pub use state::{HistoryBinding, Transaction};
