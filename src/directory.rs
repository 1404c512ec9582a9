//! The search capability and the entry point taking an LDAP URL.
use std::future::Future;

use tracing::{debug, error};

use crate::{
	config::Config,
	descriptor::QueryDescriptor,
	entry::{Entry, SearchResult},
	error::Error,
	session,
	transport::{self, Connection},
};

/// Something that can connect to a directory server and search it.
///
/// [`NativeDirectory`] speaks LDAP itself, [`crate::ldap::Ldap3Directory`]
/// uses the `ldap3` crate.
pub trait Directory {
	/// An established, possibly bound connection.
	type Connection: Send;

	/// Connects to the server named by `descriptor`.
	fn connect(
		&self,
		descriptor: &QueryDescriptor,
	) -> impl Future<Output = Result<Self::Connection, Error>> + Send;

	/// Searches over `connection`. `on_entry` is called once per entry in
	/// arrival order, `on_complete` exactly once at the end.
	fn search<E, C>(
		&self,
		connection: &mut Self::Connection,
		descriptor: &QueryDescriptor,
		on_entry: E,
		on_complete: C,
	) -> impl Future<Output = ()> + Send
	where
		E: FnMut(&Entry) + Send,
		C: FnOnce(Result<SearchResult, Error>) + Send;

	/// Closes the connection and releases its resources.
	fn close(&self, connection: Self::Connection) -> impl Future<Output = ()> + Send;
}

/// [`Directory`] implemented on top of [`transport`] and [`session`].
#[derive(Debug, Clone, Default)]
pub struct NativeDirectory {
	/// The configuration of the LDAP client.
	config: Config,
}

impl NativeDirectory {
	/// Create a new [`NativeDirectory`] with the given configuration.
	#[must_use]
	pub fn new(config: Config) -> Self {
		Self { config }
	}

	/// The configuration in use.
	#[must_use]
	pub fn config(&self) -> &Config {
		&self.config
	}
}

impl Directory for NativeDirectory {
	type Connection = Connection;

	async fn connect(&self, descriptor: &QueryDescriptor) -> Result<Connection, Error> {
		let mut connection = transport::connect(
			descriptor.host(),
			descriptor.port(),
			descriptor.scheme().is_tls(),
			&self.config.connection,
		)
		.await?;

		if let Some(bind) = &self.config.bind {
			if let Err(err) = connection.simple_bind(&bind.dn, &bind.password).await {
				connection.close().await;
				return Err(err);
			}
		}
		Ok(connection)
	}

	async fn search<E, C>(
		&self,
		connection: &mut Connection,
		descriptor: &QueryDescriptor,
		on_entry: E,
		on_complete: C,
	) where
		E: FnMut(&Entry) + Send,
		C: FnOnce(Result<SearchResult, Error>) + Send,
	{
		session::search(connection, descriptor, &self.config.search, on_entry, on_complete).await;
	}

	async fn close(&self, mut connection: Connection) {
		connection.close().await;
	}
}

/// Searches the directory named by an LDAP URL of the form
/// `ldap[s]://host[:port]/baseDN?attrs?scope?filter`.
///
/// Entries are passed to `on_entry` as they arrive. `on_complete` is called
/// exactly once, with the result or with the first error, be it a malformed
/// URL, a connection failure or a failed search. The connection is closed
/// before `on_complete` runs.
pub async fn search_url<D, E, C>(directory: &D, url: &str, on_entry: E, on_complete: C)
where
	D: Directory + Sync,
	E: FnMut(&Entry) + Send,
	C: FnOnce(Result<SearchResult, Error>) + Send,
{
	let descriptor = match QueryDescriptor::parse(url) {
		Ok(descriptor) => descriptor,
		Err(err) => {
			debug!("Rejected LDAP URL `{url}`: {err}");
			on_complete(Err(err.into()));
			return;
		}
	};

	let mut connection = match directory.connect(&descriptor).await {
		Ok(connection) => connection,
		Err(err) => {
			error!("Could not connect to {}:{}: {err}", descriptor.host(), descriptor.port());
			on_complete(Err(err));
			return;
		}
	};

	let mut outcome = None;
	directory
		.search(&mut connection, &descriptor, on_entry, |result| outcome = Some(result))
		.await;
	directory.close(connection).await;

	on_complete(outcome.unwrap_or(Err(Error::Cancelled)));
}
