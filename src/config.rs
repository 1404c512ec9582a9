//! Config for the LDAP client.
use std::{
	fmt,
	path::{Path, PathBuf},
	sync::Arc,
	time::{Duration, SystemTime},
};

use ldap3::LdapConnSettings;
use rustls::{
	client::{ServerCertVerified, ServerCertVerifier},
	Certificate, ClientConfig, PrivateKey, RootCertStore, ServerName,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{codec::DEFAULT_MAX_MESSAGE_SIZE, error::ConnectionError};

/// LDAP client configuration. Everything about a search that is not part of
/// the LDAP URL.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
	/// Connection settings.
	#[serde(default)]
	pub connection: ConnectionConfig,
	/// Credentials for a simple bind before searching. Searches anonymously
	/// if unset.
	#[serde(default)]
	pub bind: Option<BindConfig>,
	/// Limits and flags sent with every search
	#[serde(default)]
	pub search: SearchConfig,
}

/// Configuration for how to connect to the LDAP server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection in seconds.
	#[serde(default = "default_timeout")]
	pub timeout: u64,

	/// LDAP operation timeout. For search per reply.
	#[serde(default = "default_operation_timeout")]
	pub operation_timeout: Duration,

	/// Largest message accepted from the server, in bytes.
	#[serde(default = "default_max_message_size")]
	pub max_message_size: usize,

	/// TLS config
	#[serde(default)]
	pub tls: TLSConfig,
}

fn default_timeout() -> u64 {
	10
}

fn default_operation_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_max_message_size() -> usize {
	DEFAULT_MAX_MESSAGE_SIZE
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			timeout: default_timeout(),
			operation_timeout: default_operation_timeout(),
			max_message_size: default_max_message_size(),
			tls: TLSConfig::default(),
		}
	}
}

/// TLS Configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TLSConfig {
	/// Use StartTLS extended operation for establishing a secure connection,
	/// rather than TLS on a dedicated port. Only applies to `ldap://` URLs.
	#[serde(default)]
	pub starttls: bool,

	/// Disable verification of TLS certificates
	#[serde(default)]
	pub no_tls_verify: bool,

	/// TLS root certificates path. Used in addition to the system roots.
	#[serde(default)]
	pub root_certificates_path: Option<PathBuf>,

	/// Path of the TLS client key to use for the connection
	#[serde(default)]
	pub client_key_path: Option<PathBuf>,

	/// Path of the TLS client certificate to use for the connection
	#[serde(default)]
	pub client_certificate_path: Option<PathBuf>,
}

/// Credentials for a simple bind.
#[derive(Clone, Serialize, Deserialize)]
pub struct BindConfig {
	/// DN to bind as
	pub dn: String,
	/// Password of the bind DN
	pub password: String,
}

impl fmt::Debug for BindConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BindConfig").field("dn", &self.dn).field("password", &"<redacted>").finish()
	}
}

/// How aliases are dereferenced during a search (RFC 4511 section 4.5.1.3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerefAliases {
	/// Never dereference aliases
	#[default]
	Never,
	/// Dereference aliases below the base entry
	InSearching,
	/// Dereference the base entry only
	FindingBaseObj,
	/// Always dereference aliases
	Always,
}

impl DerefAliases {
	pub(crate) fn to_protocol(self) -> i64 {
		match self {
			DerefAliases::Never => 0,
			DerefAliases::InSearching => 1,
			DerefAliases::FindingBaseObj => 2,
			DerefAliases::Always => 3,
		}
	}

	pub(crate) fn from_protocol(value: i64) -> Option<Self> {
		match value {
			0 => Some(DerefAliases::Never),
			1 => Some(DerefAliases::InSearching),
			2 => Some(DerefAliases::FindingBaseObj),
			3 => Some(DerefAliases::Always),
			_ => None,
		}
	}
}

/// Limits and flags of a search request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchConfig {
	/// Maximum number of entries the server should return, 0 for no limit
	#[serde(default)]
	pub size_limit: i32,
	/// Maximum time in seconds the server should spend, 0 for no limit
	#[serde(default)]
	pub time_limit: i32,
	/// Only return attribute descriptions, no values
	#[serde(default)]
	pub types_only: bool,
	/// Alias dereferencing
	#[serde(default)]
	pub deref_aliases: DerefAliases,
}

impl ConnectionConfig {
	/// Timeout for establishing the TCP connection.
	#[must_use]
	pub fn connect_timeout(&self) -> Duration {
		Duration::from_secs(self.timeout)
	}

	/// Create a [`LdapConnSettings`] based on this [`ConnectionConfig`]
	pub(crate) fn to_settings(&self) -> Result<LdapConnSettings, ConnectionError> {
		if self.tls.root_certificates_path.is_some()
			|| self.tls.client_key_path.is_some()
			|| self.tls.client_certificate_path.is_some()
		{
			return Err(ConnectionError::TlsConfig(
				"Custom certificates are only supported by the native directory".to_owned(),
			));
		}

		let mut settings = LdapConnSettings::new();
		settings = settings.set_conn_timeout(self.connect_timeout());
		settings = settings.set_starttls(self.tls.starttls);
		settings = settings.set_no_tls_verify(self.tls.no_tls_verify);
		Ok(settings)
	}
}

impl TLSConfig {
	/// Build the rustls client configuration used for `ldaps://` and StartTLS
	pub(crate) async fn client_config(&self) -> Result<Arc<ClientConfig>, ConnectionError> {
		let mut roots = RootCertStore::empty();
		match rustls_native_certs::load_native_certs() {
			Ok(certificates) => {
				for certificate in certificates {
					if let Err(err) = roots.add(&Certificate(certificate.0)) {
						debug!("Skipping system root certificate: {err}");
					}
				}
			}
			Err(err) => warn!("Could not load system root certificates: {err}"),
		}

		if let Some(path) = &self.root_certificates_path {
			for certificate in read_certificates(path).await? {
				roots.add(&certificate).map_err(|err| {
					ConnectionError::TlsConfig(format!("Could not add root certificate: {err}"))
				})?;
			}
		}

		let builder = ClientConfig::builder().with_safe_defaults().with_root_certificates(roots);
		let mut config = match (&self.client_key_path, &self.client_certificate_path) {
			(Some(key_path), Some(cert_path)) => {
				let certificates = read_certificates(cert_path).await?;
				let key = rustls_pemfile::pkcs8_private_keys(
					&mut tokio::fs::read(key_path).await?.as_slice(),
				)
				.map_err(|_| {
					ConnectionError::TlsConfig("Could not read client certificates".to_owned())
				})?
				.into_iter()
				.next()
				.ok_or_else(|| {
					ConnectionError::TlsConfig("No PKCS8 key in client key file".to_owned())
				})?;
				builder
					.with_client_auth_cert(certificates, PrivateKey(key))
					.map_err(|err| ConnectionError::TlsConfig(err.to_string()))?
			}
			(None, None) => builder.with_no_client_auth(),
			_ => {
				return Err(ConnectionError::TlsConfig(
					"Both a client certificate and key file in PKCS8 format must be specified"
						.to_owned(),
				))
			}
		};

		if self.no_tls_verify {
			warn!("TLS certificate verification is disabled");
			config.dangerous().set_certificate_verifier(Arc::new(NoVerification));
		}
		Ok(Arc::new(config))
	}
}

/// Reads all PEM certificates of a file, failing if there are none.
async fn read_certificates(path: &Path) -> Result<Vec<Certificate>, ConnectionError> {
	let pem = tokio::fs::read(path).await?;
	let certificates = rustls_pemfile::certs(&mut pem.as_slice())
		.map_err(|_| ConnectionError::TlsConfig("Could not read certificate".to_owned()))?;
	if certificates.is_empty() {
		return Err(ConnectionError::TlsConfig(format!(
			"No certificates found in {}",
			path.display()
		)));
	}
	Ok(certificates.into_iter().map(Certificate).collect())
}

/// Accepts any server certificate. Only installed with `no_tls_verify`.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
	fn verify_server_cert(
		&self,
		_end_entity: &Certificate,
		_intermediates: &[Certificate],
		_server_name: &ServerName,
		_scts: &mut dyn Iterator<Item = &[u8]>,
		_ocsp_response: &[u8],
		_now: SystemTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}
}
