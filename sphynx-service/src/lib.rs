//! Connexion object, flood-resistant connexion map, worker-task pool, and
//! the UDP-facing server/client façade.

pub mod client;
pub mod config;
pub mod connexion;
pub mod connexion_map;
pub mod error;
pub mod host;
pub mod net_addr;
pub mod server;
pub mod worker;

pub use client::{ClientEvent, SphynxClient};
pub use config::SphynxConfig;
pub use connexion::{Connexion, Lifecycle};
pub use connexion_map::ConnexionMap;
pub use error::Error;
pub use host::{SphynxHost, UdpHost};
pub use net_addr::NetAddr;
pub use server::{ServerEvent, SphynxServer};
pub use worker::WorkerPool;
