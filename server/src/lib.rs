//! # Fleet Directory Library
//!
//! This library implements the directory that sits between a fleet of
//! game-hosting servers and the front ends that route players to them. It keeps
//! the authoritative list of games, tracks which fleet member owns each game,
//! and answers "where is this user playing" questions.
//!
//! ## Core Responsibilities
//!
//! ### Fleet Membership
//! Fleet members register over UDP, report their load and declare a lifecycle
//! state. The registry keeps the external placement balancer in step with
//! every transition:
//! - A member enters rotation when it is connected and `Normal`
//! - It leaves rotation when it disconnects, goes offline or out of rotation
//! - A disconnected member is kept for a grace period so a quick reconnect
//!   resumes it with its games intact
//!
//! ### Game Replication
//! After every (re)connect a member replays its game list. A per-connection
//! peer counts the replayed games against the count the member declared and
//! finishes replication once they match, or when the finish check fires.
//!
//! ### Game Directory
//! Games live in a single table keyed by lobby and game id. Games owned by a
//! member that went away are orphaned rather than dropped. Preserved orphans
//! stay listed until an expiry sweep removes them, unless their member
//! reclaims them first.
//!
//! ### Presence
//! Front ends report client connects, disconnects and game joins. Lookups
//! return whether each user is online and, subject to a filter, which game
//! they are in.
//!
//! ### Load Feedback
//! Player and game counts from all members are summed with the connected
//! client count and pushed to stats subscribers, at most once per publish
//! interval.
//!
//! ## Architecture Design
//!
//! Each component is a tokio task that owns its state and is driven through a
//! cloneable handle. Handles post commands over unbounded channels; calls
//! that need an answer carry a oneshot reply. Timers are delivered back into
//! the owning task's queue and carry a token so stale expirations are
//! ignored. The game table is additionally shared behind an `RwLock` so
//! lookups do not have to queue behind writes.
//!
//! ## Module Organization
//!
//! - `config`: command line flags and derived durations
//! - `directory`: game records, the game table and its owning task
//! - `error`: the crate-wide error type
//! - `feedback`: fleet-wide load totals and stats subscriptions
//! - `fleet`: member identity, registry, replication peers, load prediction
//!   and the placement balancer contract
//! - `network`: the UDP intake that routes packets to the components
//! - `presence`: per-user online state and game sessions
//! - `timer`: cancellable one-shot timers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use directory_server::config::DirectoryConfig;
//! use directory_server::directory::GameDirectory;
//! use directory_server::feedback::LoadFeedbackAggregator;
//! use directory_server::fleet::{LoggingBalancer, ServerFleetRegistry};
//! use directory_server::network::{Components, Server};
//! use directory_server::presence::PresenceDirectory;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DirectoryConfig::default();
//!
//!     let directory = GameDirectory::spawn(&config);
//!     let feedback = LoadFeedbackAggregator::spawn(&config);
//!     let registry = ServerFleetRegistry::spawn(
//!         &config,
//!         directory.clone(),
//!         feedback.clone(),
//!         Arc::new(LoggingBalancer),
//!     );
//!     let presence = PresenceDirectory::spawn(&config, directory, feedback.clone());
//!
//!     let mut server = Server::new(&config, Components { registry, presence, feedback }).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod feedback;
pub mod fleet;
pub mod network;
pub mod presence;
pub mod timer;
