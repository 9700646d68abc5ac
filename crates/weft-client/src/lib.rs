//! Weft Client
//!
//! Async HTTP client for the administrative endpoints of a Weft server:
//! remote script execution, global state and the route table.
//!
//! ```no_run
//! use weft_client::WeftClient;
//!
//! # async fn run() -> weft_common::Result<()> {
//! let client = WeftClient::new("http://127.0.0.1:3000")?;
//! let envelope = client.execute("state.visits = (state.visits || 0) + 1").await?;
//! println!("{:?}", envelope.result);
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use client::{RouteSummary, WeftClient};
