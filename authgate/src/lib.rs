//! # authgate
//!
//! An authentication gateway that sits in front of an HTTP application and
//! only lets signed-in users through.
//!
//! Users sign in with an OAuth2 provider (Google, GitHub, Microsoft or any
//! OpenID Connect issuer), with a one-time email link or code, or with a
//! shared password. Once signed in, requests are forwarded to the upstream
//! application carrying the user's identity in headers.
//!
//! ## Features
//!
//! - **OAuth2 / OIDC**: Authorization code flow with signed, short-lived state cookies
//! - **Email Sign-in**: Magic links and 12-character codes, single use, rate limited
//! - **Path Rules**: Exact, prefix, regex and glob rules that allow, deny or require a session
//! - **Identity Forwarding**: Headers and query parameters, optionally encrypted and compressed
//! - **Pluggable Storage**: In-memory, SQLite or Redis behind one key-value trait
//!
//! ## Example
//!
//! ```rust,no_run
//! use authgate::{Gateway, GatewayConfig, ProviderConfig, ProviderKind};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = GatewayConfig::new(std::env::var("COOKIE_SECRET")?).with_provider(
//!     ProviderConfig::new("github", ProviderKind::Github).with_client("id", "secret"),
//! );
//! let gateway = Gateway::builder().config(config).build()?;
//!
//! let upstream = axum::Router::new().route("/", axum::routing::get(|| async { "hello" }));
//! let app = gateway.router(upstream);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod clock;
pub mod config;
pub mod cookies;
pub mod email;
pub mod error;
pub mod forward;
pub mod oauth;
pub mod pages;
pub mod password;
pub mod providers;
pub mod rules;
pub mod server;
pub mod session;
pub mod store;

pub use auth::{AuthenticatedUser, Identity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CookieConfig, GatewayConfig};
pub use email::{EmailAuth, EmailMessage, EmailSender, EmailSettings, LogEmailSender};
pub use error::{Error, Result};
pub use forward::{Filter, Forwarder, ForwardingField};
pub use password::PasswordAuth;
pub use providers::{Provider, ProviderConfig, ProviderKind, ProviderRegistry};
pub use rules::{Action, RuleConfig, RuleSet};
pub use server::{Gateway, GatewayBuilder, is_safe_redirect};
pub use session::{Session, SessionManager};
pub use store::{KeyValueStore, StoreSet};
