//! Library to backup the databases of a [PostgreSQL][pg] server.
//!
//! Every configured database that exists on the server is dumped with
//! [`pg_dump`][pg_dump] in its custom format and gzip compressed into a
//! timestamped archive. See the [`backup`] module for the moving parts and
//! [`config`] for the configuration file.
//!
//! [pg]: https://www.postgresql.org/
//! [pg_dump]: https://www.postgresql.org/docs/current/app-pgdump.html

#![forbid(unsafe_code)]

pub mod backup;
pub mod cli;
pub mod config;
