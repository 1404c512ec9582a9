//! Parsing of LDAP URLs (RFC 4516) into immutable query descriptors.
//!
//! The accepted form is `ldap[s]://host[:port]/baseDN?attrs?scope?filter?extensions`.
//! Compared to RFC 4516 this client defaults the scope to `sub`, which is what
//! one expects when handing a URL to a search tool.
use std::{fmt, str::FromStr};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::debug;
use url::{Host, Url};

use crate::{error::ParseError, filter::Filter};

/// The filter used when the URL does not specify one.
pub const DEFAULT_FILTER: &str = "(objectClass=*)";

/// Characters escaped when re-serializing a URL component. `/` is escaped so
/// that a DN such as `ou=a/..` is not read back as dot segments.
const COMPONENT: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'"')
	.add(b'#')
	.add(b'%')
	.add(b'/')
	.add(b'<')
	.add(b'>')
	.add(b'?')
	.add(b'`');

/// URL scheme, which decides whether TLS is used from the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
	/// Plain LDAP, optionally upgraded with StartTLS.
	Ldap,
	/// LDAP over TLS.
	Ldaps,
}

impl Scheme {
	/// Port used when the URL does not carry one.
	#[must_use]
	pub fn default_port(self) -> u16 {
		match self {
			Scheme::Ldap => 389,
			Scheme::Ldaps => 636,
		}
	}

	/// Whether the connection is TLS wrapped from the start.
	#[must_use]
	pub fn is_tls(self) -> bool {
		self == Scheme::Ldaps
	}

	/// The scheme as it appears in a URL.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Scheme::Ldap => "ldap",
			Scheme::Ldaps => "ldaps",
		}
	}
}

/// Search breadth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scope {
	/// Only the base entry.
	Base,
	/// Immediate children of the base entry.
	One,
	/// The base entry and its entire subtree.
	#[default]
	Sub,
}

impl Scope {
	/// The scope as it appears in a URL.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Scope::Base => "base",
			Scope::One => "one",
			Scope::Sub => "sub",
		}
	}

	/// The value of the `scope` ENUMERATED of a SearchRequest.
	pub(crate) fn to_protocol(self) -> i64 {
		match self {
			Scope::Base => 0,
			Scope::One => 1,
			Scope::Sub => 2,
		}
	}

	pub(crate) fn from_protocol(value: i64) -> Option<Self> {
		match value {
			0 => Some(Scope::Base),
			1 => Some(Scope::One),
			2 => Some(Scope::Sub),
			_ => None,
		}
	}
}

impl From<Scope> for ldap3::Scope {
	fn from(scope: Scope) -> Self {
		match scope {
			Scope::Base => ldap3::Scope::Base,
			Scope::One => ldap3::Scope::OneLevel,
			Scope::Sub => ldap3::Scope::Subtree,
		}
	}
}

/// Everything needed to perform a search, as described by an LDAP URL.
/// Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
	/// Whether to use TLS.
	scheme: Scheme,
	/// Host name or IP address, without brackets.
	host: String,
	/// TCP port, defaulted from the scheme.
	port: u16,
	/// The search base.
	base_dn: String,
	/// Requested attributes, in URL order. Empty requests all user attributes.
	attributes: Vec<String>,
	/// Search scope.
	scope: Scope,
	/// The filter exactly as given in the URL.
	filter: String,
	/// The filter, parsed.
	search_filter: Filter,
}

impl QueryDescriptor {
	/// Parses an LDAP URL.
	pub fn parse(input: &str) -> Result<Self, ParseError> {
		let url = Url::parse(input.trim())?;
		let scheme = match url.scheme() {
			"ldap" => Scheme::Ldap,
			"ldaps" => Scheme::Ldaps,
			other => return Err(ParseError::UnsupportedScheme(other.to_owned())),
		};
		if !url.username().is_empty() || url.password().is_some() {
			return Err(ParseError::UnexpectedPart("user info"));
		}
		if url.fragment().is_some() {
			return Err(ParseError::UnexpectedPart("fragment"));
		}

		let host = match url.host() {
			Some(Host::Domain(domain)) if !domain.is_empty() => decode(domain)?,
			Some(Host::Ipv4(addr)) => addr.to_string(),
			Some(Host::Ipv6(addr)) => addr.to_string(),
			_ => return Err(ParseError::MissingHost),
		};
		let port = url.port().unwrap_or_else(|| scheme.default_port());
		let base_dn = decode(url.path().strip_prefix('/').unwrap_or_else(|| url.path()))?;

		let components: Vec<&str> = url.query().map(|query| query.split('?').collect()).unwrap_or_default();
		if components.len() > 4 {
			return Err(ParseError::TooManyComponents);
		}
		let component = |index: usize| components.get(index).map_or(Ok(String::new()), |raw| decode(raw));

		let attributes = component(0)?
			.split(',')
			.map(str::trim)
			.filter(|attr| !attr.is_empty())
			.map(str::to_owned)
			.collect();

		let scope = match component(1)?.to_ascii_lowercase().as_str() {
			"" | "sub" => Scope::Sub,
			"one" => Scope::One,
			"base" => Scope::Base,
			other => return Err(ParseError::InvalidScope(other.to_owned())),
		};

		let mut filter = component(2)?;
		if filter.trim().is_empty() {
			DEFAULT_FILTER.clone_into(&mut filter);
		}
		let search_filter = Filter::parse(&filter)?;

		if let Some(extensions) = components.get(3) {
			for extension in extensions.split(',').filter(|ext| !ext.is_empty()) {
				let extension = decode(extension)?;
				if extension.starts_with('!') {
					return Err(ParseError::UnsupportedExtension(extension));
				}
				debug!("Ignoring non-critical LDAP URL extension {extension}");
			}
		}

		Ok(Self { scheme, host, port, base_dn, attributes, scope, filter, search_filter })
	}

	/// Whether to use TLS from the start.
	#[must_use]
	pub fn scheme(&self) -> Scheme {
		self.scheme
	}

	/// Host name or IP address of the directory server.
	#[must_use]
	pub fn host(&self) -> &str {
		&self.host
	}

	/// TCP port of the directory server.
	#[must_use]
	pub fn port(&self) -> u16 {
		self.port
	}

	/// Base DN of the search.
	#[must_use]
	pub fn base_dn(&self) -> &str {
		&self.base_dn
	}

	/// Requested attributes. Empty means all user attributes.
	#[must_use]
	pub fn attributes(&self) -> &[String] {
		&self.attributes
	}

	/// Scope of the search.
	#[must_use]
	pub fn scope(&self) -> Scope {
		self.scope
	}

	/// The filter in string form, as given in the URL.
	#[must_use]
	pub fn filter(&self) -> &str {
		&self.filter
	}

	/// The parsed filter.
	#[must_use]
	pub fn search_filter(&self) -> &Filter {
		&self.search_filter
	}

	/// Host formatted for use in a URL authority.
	fn url_host(&self) -> String {
		if self.host.contains(':') {
			format!("[{}]", self.host)
		} else {
			self.host.clone()
		}
	}

	/// URL of the server alone, without any search parameters.
	pub fn server_url(&self) -> Result<Url, ParseError> {
		Ok(Url::parse(&format!("{}://{}:{}", self.scheme.as_str(), self.url_host(), self.port))?)
	}
}

impl FromStr for QueryDescriptor {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		QueryDescriptor::parse(s)
	}
}

/// The canonical URL form, from which [`QueryDescriptor::parse`] yields an
/// equal descriptor.
impl fmt::Display for QueryDescriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}://{}:{}/{}?{}?{}?{}",
			self.scheme.as_str(),
			self.url_host(),
			self.port,
			utf8_percent_encode(&self.base_dn, COMPONENT),
			utf8_percent_encode(&self.attributes.join(","), COMPONENT),
			self.scope.as_str(),
			utf8_percent_encode(&self.filter, COMPONENT),
		)
	}
}

/// Percent-decodes a URL component.
fn decode(raw: &str) -> Result<String, ParseError> {
	percent_decode_str(raw)
		.decode_utf8()
		.map(|decoded| decoded.into_owned())
		.map_err(|_| ParseError::InvalidEncoding)
}
