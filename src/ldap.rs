//! [`Directory`] backed by the `ldap3` crate.

use ldap3::{
	adapters::{Adapter, EntriesOnly},
	LdapConnAsync, SearchEntry, SearchOptions,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
	config::{Config, DerefAliases},
	descriptor::QueryDescriptor,
	directory::Directory,
	entry::{Entry, SearchResult},
	error::Error,
};

/// Searches through [`ldap3`]. Continuation references are dropped by this
/// implementation, and custom TLS certificates are not supported.
#[derive(Debug, Clone, Default)]
pub struct Ldap3Directory {
	/// The configuration of the LDAP client.
	config: Config,
}

/// A connection of the [`Ldap3Directory`].
#[derive(Debug)]
pub struct Ldap3Connection {
	/// Handle for issuing operations.
	ldap: ldap3::Ldap,
	/// Background task driving the connection.
	driver: JoinHandle<()>,
}

impl From<DerefAliases> for ldap3::DerefAliases {
	fn from(deref: DerefAliases) -> Self {
		match deref {
			DerefAliases::Never => ldap3::DerefAliases::Never,
			DerefAliases::InSearching => ldap3::DerefAliases::Searching,
			DerefAliases::FindingBaseObj => ldap3::DerefAliases::Finding,
			DerefAliases::Always => ldap3::DerefAliases::Always,
		}
	}
}

impl Ldap3Directory {
	/// Create a new [`Ldap3Directory`] with the given configuration.
	#[must_use]
	pub fn new(config: Config) -> Self {
		Self { config }
	}

	/// Perform the search, pushing every entry to `on_entry`
	async fn run_search<E>(
		&self,
		connection: &mut Ldap3Connection,
		descriptor: &QueryDescriptor,
		on_entry: &mut E,
	) -> Result<SearchResult, Error>
	where
		E: FnMut(&Entry) + Send,
	{
		let options = &self.config.search;
		let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![Box::new(EntriesOnly::new())];
		let filter = descriptor.search_filter().to_string();

		let mut search = connection
			.ldap
			.with_search_options(
				SearchOptions::new()
					.deref(options.deref_aliases.into())
					.sizelimit(options.size_limit)
					.timelimit(options.time_limit)
					.typesonly(options.types_only),
			)
			.with_timeout(self.config.connection.operation_timeout)
			.streaming_search_with(
				adapters,
				descriptor.base_dn(),
				descriptor.scope().into(),
				&filter,
				descriptor.attributes().to_vec(),
			)
			.await?;

		let mut entries = Vec::new();
		while let Some(entry) = search.next().await?.map(SearchEntry::construct) {
			let entry = Entry::from(entry);
			on_entry(&entry);
			entries.push(entry);
		}
		search.finish().await.success()?;

		Ok(SearchResult { entries, references: Vec::new() })
	}
}

impl Directory for Ldap3Directory {
	type Connection = Ldap3Connection;

	/// Create a connection to an ldap server based on the settings and the
	/// server part of the URL.
	async fn connect(&self, descriptor: &QueryDescriptor) -> Result<Ldap3Connection, Error> {
		let settings = self.config.connection.to_settings()?;
		let url = descriptor.server_url()?;
		let (conn, ldap) = LdapConnAsync::from_url_with_settings(settings, &url).await?;
		let driver = tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("Ldap connection error {err}");
			}
		});
		let mut connection = Ldap3Connection { ldap, driver };

		if let Some(bind) = &self.config.bind {
			let bound = connection
				.ldap
				.with_timeout(self.config.connection.operation_timeout)
				.simple_bind(&bind.dn, &bind.password)
				.await
				.and_then(ldap3::LdapResult::success);
			if let Err(err) = bound {
				self.close(connection).await;
				return Err(err.into());
			}
		}
		Ok(connection)
	}

	async fn search<E, C>(
		&self,
		connection: &mut Ldap3Connection,
		descriptor: &QueryDescriptor,
		mut on_entry: E,
		on_complete: C,
	) where
		E: FnMut(&Entry) + Send,
		C: FnOnce(Result<SearchResult, Error>) + Send,
	{
		on_complete(self.run_search(connection, descriptor, &mut on_entry).await);
	}

	async fn close(&self, mut connection: Ldap3Connection) {
		if let Err(err) = connection.ldap.unbind().await {
			debug!("Could not unbind: {err}");
			connection.driver.abort();
		}
		if let Err(err) = connection.driver.await {
			if !err.is_cancelled() {
				warn!("Failed to join background task: {err}");
			}
		}
	}
}
