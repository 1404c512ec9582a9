//! Error codes

use std::{fmt, time::Duration};

use crate::filter::FilterError;

/// Errors that can occur when searching a directory. Exactly one of these is
/// delivered to a search's completion callback when it fails.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The LDAP URL was malformed or used an unsupported scheme.
	#[error("Invalid LDAP URL: {0}")]
	Parse(#[from] ParseError),
	/// The TCP connection or TLS session could not be established or broke.
	#[error("Connection failed: {0}")]
	Connection(#[from] ConnectionError),
	/// The server sent bytes which are not a valid LDAP message.
	#[error("Malformed message: {0}")]
	Decode(#[from] DecodeError),
	/// The server answered with a result code other than `success`.
	#[error("Server returned {code}: {message}")]
	Protocol {
		/// The result code sent by the server.
		code: ResultCode,
		/// The `matchedDN` of the result, possibly empty.
		matched_dn: String,
		/// The diagnostic message of the result, possibly empty.
		message: String,
		/// Referral URLs, only present for [`ResultCode::Referral`].
		referrals: Vec<String>,
	},
	/// The connection was closed while the search was outstanding.
	#[error("Search cancelled")]
	Cancelled,
}

impl Error {
	/// Coarse classification of the error.
	#[must_use]
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::Parse(_) => ErrorKind::Parse,
			Error::Connection(_) => ErrorKind::Connection,
			Error::Decode(_) => ErrorKind::Decode,
			Error::Protocol { code, .. } => ErrorKind::Protocol(*code),
			Error::Cancelled => ErrorKind::Cancelled,
		}
	}

	/// Builds a [`Error::Protocol`] with only a result code and message.
	pub(crate) fn protocol(code: ResultCode, message: impl Into<String>) -> Self {
		Error::Protocol {
			code,
			matched_dn: String::new(),
			message: message.into(),
			referrals: Vec::new(),
		}
	}
}

impl From<ldap3::LdapError> for Error {
	fn from(err: ldap3::LdapError) -> Self {
		match err {
			ldap3::LdapError::LdapResult { result } => Error::Protocol {
				code: ResultCode::from(result.rc),
				matched_dn: result.matched,
				message: result.text,
				referrals: result.refs,
			},
			other => Error::Connection(ConnectionError::Ldap(other)),
		}
	}
}

/// Classification of [`Error`]s. Failing LDAP result codes each map to a
/// distinct kind through [`ErrorKind::Protocol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	/// Malformed URL.
	Parse,
	/// TCP or TLS failure.
	Connection,
	/// Malformed BER.
	Decode,
	/// LDAP result code other than success.
	Protocol(ResultCode),
	/// The connection was closed during the search.
	Cancelled,
}

/// Reasons an LDAP URL is rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
	/// The URL is not syntactically a URL.
	#[error("Malformed URL: {0}")]
	Url(#[from] url::ParseError),
	/// Scheme other than `ldap` or `ldaps`.
	#[error("Unsupported scheme `{0}`")]
	UnsupportedScheme(String),
	/// The URL carries no host.
	#[error("Missing host")]
	MissingHost,
	/// The scope component is not `base`, `one` or `sub`.
	#[error("Unknown scope `{0}`")]
	InvalidScope(String),
	/// The filter component is not a valid search filter.
	#[error("Invalid filter: {0}")]
	InvalidFilter(#[from] FilterError),
	/// A component is not valid percent-encoded UTF-8.
	#[error("Component is not valid UTF-8 after percent-decoding")]
	InvalidEncoding,
	/// A critical extension this client does not implement.
	#[error("Unsupported critical extension `{0}`")]
	UnsupportedExtension(String),
	/// More than four `?`-separated components after the DN.
	#[error("Too many URL components")]
	TooManyComponents,
	/// User info, a fragment or other parts which LDAP URLs do not have.
	#[error("Unexpected URL part: {0}")]
	UnexpectedPart(&'static str),
}

/// Failures of the transport layer.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
	/// Socket level failure.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// Establishing the connection or waiting for a reply took too long.
	#[error("Timed out after {0:?}")]
	Timeout(Duration),
	/// The TLS configuration could not be built.
	#[error("TLS configuration error: {0}")]
	TlsConfig(String),
	/// The TLS handshake failed, including certificate validation failures.
	#[error("TLS handshake failed: {0}")]
	Tls(std::io::Error),
	/// The host is not usable as a TLS server name.
	#[error("Invalid TLS server name `{0}`")]
	InvalidServerName(String),
	/// The server refused the StartTLS extended operation.
	#[error("StartTLS refused by server: {0}")]
	StartTlsRefused(ResultCode),
	/// The connection is closed or failed and can no longer be used.
	#[error("Connection is closed")]
	Closed,
	/// The peer closed the socket.
	#[error("Connection closed by server")]
	Eof,
	/// All message IDs of this connection have been used.
	#[error("Message IDs exhausted")]
	MessageIdsExhausted,
	/// An error of the `ldap3` backed directory.
	#[error(transparent)]
	Ldap(ldap3::LdapError),
}

/// Failures decoding BER encoded LDAP messages.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
	/// LDAP forbids the indefinite length form.
	#[error("Indefinite length encoding")]
	IndefiniteLength,
	/// The length has more octets than can be represented.
	#[error("Length encoded in {0} octets")]
	LengthOverflow(usize),
	/// The message is larger than the configured maximum.
	#[error("Message of {len} bytes exceeds the maximum of {max}")]
	MessageTooLarge {
		/// Announced length.
		len: usize,
		/// Configured maximum.
		max: usize,
	},
	/// Tag numbers above 30 are not used by LDAP.
	#[error("High tag number form")]
	HighTagNumber,
	/// A different element than expected was found.
	#[error("Expected tag 0x{expected:02X}, found 0x{found:02X}")]
	UnexpectedTag {
		/// Tag required by the grammar.
		expected: u8,
		/// Tag found in the input.
		found: u8,
	},
	/// An element extends past the end of its enclosing element.
	#[error("Element truncated")]
	Truncated,
	/// An element is followed by bytes which do not belong to any element.
	#[error("Trailing data after element")]
	TrailingData,
	/// INTEGER or ENUMERATED with an empty or oversized body.
	#[error("Invalid integer")]
	InvalidInteger,
	/// BOOLEAN whose body is not exactly one octet.
	#[error("Invalid boolean")]
	InvalidBoolean,
	/// An LDAPString that is not UTF-8.
	#[error("Invalid UTF-8 string")]
	InvalidUtf8,
	/// A filter choice tag defined by neither RFC 4511 nor this client.
	#[error("Unknown filter type 0x{0:02X}")]
	UnknownFilter(u8),
	/// `and`, `or` and `not` nested deeper than
	/// [`MAX_FILTER_DEPTH`](crate::filter::MAX_FILTER_DEPTH).
	#[error("Filter nested too deeply")]
	FilterTooDeep,
	/// A `SubstringFilter` without any substring.
	#[error("Empty substring filter")]
	EmptySubstrings,
	/// A request operation sent by the server.
	#[error("Request operation 0x{0:02X} received from the server")]
	UnexpectedRequest(u8),
	/// An operation tag this client does not know.
	#[error("Unknown protocol operation 0x{0:02X}")]
	UnknownOperation(u8),
	/// An enumerated value outside of its defined range.
	#[error("Invalid {what} value {value}")]
	InvalidEnumerated {
		/// Name of the field.
		what: &'static str,
		/// Value received.
		value: i64,
	},
	/// A message ID outside of `0..=2^31-1`.
	#[error("Invalid message ID {0}")]
	InvalidMessageId(i64),
}

/// LDAP result codes as defined in RFC 4511 section 4.1.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ResultCode {
	Success,
	OperationsError,
	ProtocolError,
	TimeLimitExceeded,
	SizeLimitExceeded,
	CompareFalse,
	CompareTrue,
	AuthMethodNotSupported,
	StrongerAuthRequired,
	Referral,
	AdminLimitExceeded,
	UnavailableCriticalExtension,
	ConfidentialityRequired,
	SaslBindInProgress,
	NoSuchAttribute,
	UndefinedAttributeType,
	InappropriateMatching,
	ConstraintViolation,
	AttributeOrValueExists,
	InvalidAttributeSyntax,
	NoSuchObject,
	AliasProblem,
	InvalidDnSyntax,
	AliasDereferencingProblem,
	InappropriateAuthentication,
	InvalidCredentials,
	InsufficientAccessRights,
	Busy,
	Unavailable,
	UnwillingToPerform,
	LoopDetect,
	NamingViolation,
	ObjectClassViolation,
	NotAllowedOnNonLeaf,
	NotAllowedOnRdn,
	EntryAlreadyExists,
	ObjectClassModsProhibited,
	AffectsMultipleDsas,
	Other,
	/// A code not assigned by RFC 4511.
	Unknown(u32),
}

/// Assigned result codes and their RFC 4511 names.
const RESULT_CODES: &[(u32, ResultCode, &str)] = &[
	(0, ResultCode::Success, "success"),
	(1, ResultCode::OperationsError, "operationsError"),
	(2, ResultCode::ProtocolError, "protocolError"),
	(3, ResultCode::TimeLimitExceeded, "timeLimitExceeded"),
	(4, ResultCode::SizeLimitExceeded, "sizeLimitExceeded"),
	(5, ResultCode::CompareFalse, "compareFalse"),
	(6, ResultCode::CompareTrue, "compareTrue"),
	(7, ResultCode::AuthMethodNotSupported, "authMethodNotSupported"),
	(8, ResultCode::StrongerAuthRequired, "strongerAuthRequired"),
	(10, ResultCode::Referral, "referral"),
	(11, ResultCode::AdminLimitExceeded, "adminLimitExceeded"),
	(12, ResultCode::UnavailableCriticalExtension, "unavailableCriticalExtension"),
	(13, ResultCode::ConfidentialityRequired, "confidentialityRequired"),
	(14, ResultCode::SaslBindInProgress, "saslBindInProgress"),
	(16, ResultCode::NoSuchAttribute, "noSuchAttribute"),
	(17, ResultCode::UndefinedAttributeType, "undefinedAttributeType"),
	(18, ResultCode::InappropriateMatching, "inappropriateMatching"),
	(19, ResultCode::ConstraintViolation, "constraintViolation"),
	(20, ResultCode::AttributeOrValueExists, "attributeOrValueExists"),
	(21, ResultCode::InvalidAttributeSyntax, "invalidAttributeSyntax"),
	(32, ResultCode::NoSuchObject, "noSuchObject"),
	(33, ResultCode::AliasProblem, "aliasProblem"),
	(34, ResultCode::InvalidDnSyntax, "invalidDNSyntax"),
	(36, ResultCode::AliasDereferencingProblem, "aliasDereferencingProblem"),
	(48, ResultCode::InappropriateAuthentication, "inappropriateAuthentication"),
	(49, ResultCode::InvalidCredentials, "invalidCredentials"),
	(50, ResultCode::InsufficientAccessRights, "insufficientAccessRights"),
	(51, ResultCode::Busy, "busy"),
	(52, ResultCode::Unavailable, "unavailable"),
	(53, ResultCode::UnwillingToPerform, "unwillingToPerform"),
	(54, ResultCode::LoopDetect, "loopDetect"),
	(64, ResultCode::NamingViolation, "namingViolation"),
	(65, ResultCode::ObjectClassViolation, "objectClassViolation"),
	(66, ResultCode::NotAllowedOnNonLeaf, "notAllowedOnNonLeaf"),
	(67, ResultCode::NotAllowedOnRdn, "notAllowedOnRDN"),
	(68, ResultCode::EntryAlreadyExists, "entryAlreadyExists"),
	(69, ResultCode::ObjectClassModsProhibited, "objectClassModsProhibited"),
	(71, ResultCode::AffectsMultipleDsas, "affectsMultipleDSAs"),
	(80, ResultCode::Other, "other"),
];

impl ResultCode {
	/// The numeric value of the code.
	#[must_use]
	pub fn code(self) -> u32 {
		if let ResultCode::Unknown(code) = self {
			return code;
		}
		RESULT_CODES.iter().find(|(_, rc, _)| *rc == self).map_or(80, |(code, _, _)| *code)
	}

	/// Whether this code reports a successful operation.
	#[must_use]
	pub fn is_success(self) -> bool {
		self == ResultCode::Success
	}
}

impl From<u32> for ResultCode {
	fn from(code: u32) -> Self {
		RESULT_CODES
			.iter()
			.find(|(value, _, _)| *value == code)
			.map_or(ResultCode::Unknown(code), |(_, rc, _)| *rc)
	}
}

impl fmt::Display for ResultCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match RESULT_CODES.iter().find(|(_, rc, _)| rc == self) {
			Some((code, _, name)) => write!(f, "{name} ({code})"),
			None => write!(f, "unknown result code ({})", self.code()),
		}
	}
}
