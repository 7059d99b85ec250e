//! NSX Policy REST API Client
//!
//! A Rust client for the subset of the NSX Policy API the operator needs:
//! create-or-update (PATCH), delete, tag search and realization state.
//!
//! # Example
//!
//! ```no_run
//! use nsx_client::{NsxClient, NsxClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = NsxClient::new(
//!     "https://nsx-manager:443".to_string(),
//!     "admin".to_string(),
//!     "secret".to_string(),
//!     false,
//! )?;
//!
//! // Find every subnet owned by a CR
//! let subnets = client.search_by_tag("VpcSubnet", "nsx-op/subnet_uid", Some("1234")).await?;
//! for subnet in subnets {
//!     let realized = client.get_realized_entities(&subnet.path).await?;
//!     println!("{} -> {:?}", subnet.path, realized);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod common;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod nsx_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::NsxClient;
pub use common::HttpClient;
pub use error::NsxError;
pub use models::*;
pub use nsx_trait::NsxClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockNsxClient;
