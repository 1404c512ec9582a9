//! Search an LDAP directory server described by an LDAP URL.
//!
//! An URL such as `ldap://host/dc=example,dc=tld?cn,mail?sub?(uid=*)` names
//! the server, the base DN, the attributes to return, the scope and the filter
//! of a search (RFC 4516). The library parses it, connects (with TLS for
//! `ldaps://`), sends the search and streams the decoded entries to a callback
//! as they arrive. A second callback receives the final outcome exactly once.
//!
//! The LDAP protocol itself is implemented in this crate: BER encoding of
//! requests and streaming decoding of responses, RFC 4515 filters, simple bind
//! and StartTLS. The same [`Directory`] capability is also available on top of
//! the [`ldap3`] crate through [`ldap::Ldap3Directory`].
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate is an
//! excellent resource.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! A minimal example of running a search might look like so:
//! ```no_run
//! # async fn run() {
//! use ldap_search::{
//!     config::{BindConfig, Config},
//!     search_url, EntryExt, NativeDirectory,
//! };
//!
//! // Configuration can also be deserialized with serde. It's hand-constructed
//! // here for demonstration purposes.
//! let config = Config {
//!     bind: Some(BindConfig {
//!         dn: "cn=admin,dc=example,dc=org".to_owned(),
//!         password: "verysecret".to_owned(),
//!     }),
//!     ..Config::default()
//! };
//!
//! let directory = NativeDirectory::new(config);
//! search_url(
//!     &directory,
//!     "ldap://localhost/ou=people,dc=example,dc=org?cn,mail?sub?(objectClass=inetOrgPerson)",
//!     |entry| println!("{}: {:?}", entry.dn, entry.attr_first("cn")),
//!     |result| match result {
//!         Ok(result) => println!("Found {} entries", result.entries.len()),
//!         Err(err) => eprintln!("Search failed: {err}"),
//!     },
//! )
//! .await;
//! # }
//! ```
//!
//! # Limitations
//! * One search at a time per connection, requests are not pipelined.
//! * Referrals and continuation references are reported, never chased.
//! * Only simple binds, no SASL.
//! * Request and response controls are not supported, response controls are
//!   skipped.

mod ber;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod directory;
pub mod entry;
pub mod error;
pub mod filter;
pub mod ldap;
pub mod session;
pub mod transport;

pub use ldap3::{self, SearchEntry};

pub use crate::{
	config::{BindConfig, Config, ConnectionConfig, SearchConfig, TLSConfig},
	descriptor::{QueryDescriptor, Scheme, Scope},
	directory::{search_url, Directory, NativeDirectory},
	entry::{Entry, EntryExt, SearchResult},
	error::{Error, ErrorKind, ResultCode},
	filter::Filter,
	ldap::Ldap3Directory,
	session::{search, SearchSession, SearchState},
	transport::{connect, CloseHandle, Connection, ConnectionState},
};
