//! Encoding and decoding of LDAPv3 messages (RFC 4511 section 4).
//!
//! Only the operations a searching client needs are covered: bind, unbind,
//! search, and the extended operation used for StartTLS and the Notice of
//! Disconnection. Requests can be decoded as well, which is what a test server
//! needs.
//!
//! Decoding is streaming tolerant. [`decode_message`] returns
//! [`Decoded::NeedMore`] until a complete message is buffered, and
//! [`MessageDecoder`] keeps the buffer for callers which receive their bytes
//! in arbitrary chunks.
use std::collections::HashMap;

use crate::{
	ber::{self, BerReader, BerWriter, OCTET_STRING, SEQUENCE, SET},
	config::{DerefAliases, SearchConfig},
	descriptor::{QueryDescriptor, Scope},
	entry::Entry,
	error::{DecodeError, Error, ResultCode},
	filter::Filter,
};

/// Default upper bound for the size of a single message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Object identifier of the StartTLS extended operation (RFC 4511 section 4.14).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// Object identifier of the unsolicited Notice of Disconnection.
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

// [APPLICATION n] tags of the protocol operations
const BIND_REQUEST: u8 = 0x60;
const BIND_RESPONSE: u8 = 0x61;
const UNBIND_REQUEST: u8 = 0x42;
const SEARCH_REQUEST: u8 = 0x63;
const SEARCH_RESULT_ENTRY: u8 = 0x64;
const SEARCH_RESULT_DONE: u8 = 0x65;
const SEARCH_RESULT_REFERENCE: u8 = 0x73;
const EXTENDED_REQUEST: u8 = 0x77;
const EXTENDED_RESPONSE: u8 = 0x78;

// Context tags inside operations
const CONTROLS: u8 = 0xA0;
const REFERRAL: u8 = 0xA3;
const SIMPLE_AUTH: u8 = 0x80;
const SASL_CREDENTIALS: u8 = 0x87;
const EXTENDED_REQUEST_NAME: u8 = 0x80;
const EXTENDED_REQUEST_VALUE: u8 = 0x81;
const EXTENDED_RESPONSE_NAME: u8 = 0x8A;
const EXTENDED_RESPONSE_VALUE: u8 = 0x8B;

/// An `LDAPMessage` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
	/// Correlates responses with requests. 0 for unsolicited notifications.
	pub message_id: i32,
	/// The operation carried by the message.
	pub operation: ProtocolOp,
}

/// The protocol operations understood by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
	/// `BindRequest` with simple authentication.
	BindRequest(BindRequest),
	/// `BindResponse`.
	BindResponse(LdapResult),
	/// `UnbindRequest`.
	UnbindRequest,
	/// `SearchRequest`.
	SearchRequest(SearchParameters),
	/// `SearchResultEntry`.
	SearchResultEntry(Entry),
	/// `SearchResultReference`: continuation URLs.
	SearchResultReference(Vec<String>),
	/// `SearchResultDone`.
	SearchResultDone(LdapResult),
	/// `ExtendedRequest`.
	ExtendedRequest(ExtendedRequest),
	/// `ExtendedResponse`.
	ExtendedResponse(ExtendedResponse),
}

/// Simple bind credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
	/// Protocol version, always 3 when sent by this client.
	pub version: u8,
	/// DN to bind as. Empty for anonymous binds.
	pub name: String,
	/// Simple password.
	pub password: String,
}

/// The `LDAPResult` shared by all responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
	/// Outcome of the operation.
	pub code: ResultCode,
	/// `matchedDN`.
	pub matched_dn: String,
	/// `diagnosticMessage`.
	pub message: String,
	/// URLs of a referral result.
	pub referrals: Vec<String>,
}

impl LdapResult {
	/// A result with the given code and empty fields.
	#[must_use]
	pub fn new(code: ResultCode) -> Self {
		Self { code, matched_dn: String::new(), message: String::new(), referrals: Vec::new() }
	}

	/// Turns any code other than success into [`Error::Protocol`].
	pub fn success(self) -> Result<Self, Error> {
		if self.code.is_success() {
			Ok(self)
		} else {
			Err(Error::Protocol {
				code: self.code,
				matched_dn: self.matched_dn,
				message: self.message,
				referrals: self.referrals,
			})
		}
	}

	fn write_ber(&self, writer: &mut BerWriter) {
		writer.write_enumerated(i64::from(self.code.code()));
		writer.write_string(&self.matched_dn);
		writer.write_string(&self.message);
		if !self.referrals.is_empty() {
			writer.write_constructed(REFERRAL, |writer| {
				for url in &self.referrals {
					writer.write_string(url);
				}
			});
		}
	}

	fn read_ber(reader: &mut BerReader<'_>) -> Result<Self, DecodeError> {
		let code = reader.read_enumerated()?;
		let code = u32::try_from(code)
			.map_err(|_| DecodeError::InvalidEnumerated { what: "resultCode", value: code })?;
		let matched_dn = reader.read_string()?;
		let message = reader.read_string()?;
		let mut referrals = Vec::new();
		if let Some(content) = reader.read_optional(REFERRAL)? {
			let mut urls = BerReader::new(content);
			while !urls.is_empty() {
				referrals.push(urls.read_string()?);
			}
		}
		Ok(Self { code: ResultCode::from(code), matched_dn, message, referrals })
	}
}

/// The body of a `SearchRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParameters {
	/// `baseObject`.
	pub base_dn: String,
	/// `scope`.
	pub scope: Scope,
	/// `derefAliases`.
	pub deref_aliases: DerefAliases,
	/// `sizeLimit`, 0 for none.
	pub size_limit: i32,
	/// `timeLimit` in seconds, 0 for none.
	pub time_limit: i32,
	/// `typesOnly`.
	pub types_only: bool,
	/// `filter`.
	pub filter: Filter,
	/// `attributes`.
	pub attributes: Vec<String>,
}

impl SearchParameters {
	/// The parameters describing a search for `descriptor`.
	#[must_use]
	pub fn new(descriptor: &QueryDescriptor, options: &SearchConfig) -> Self {
		Self {
			base_dn: descriptor.base_dn().to_owned(),
			scope: descriptor.scope(),
			deref_aliases: options.deref_aliases,
			size_limit: options.size_limit,
			time_limit: options.time_limit,
			types_only: options.types_only,
			filter: descriptor.search_filter().clone(),
			attributes: descriptor.attributes().to_vec(),
		}
	}

	fn write_ber(&self, writer: &mut BerWriter) {
		writer.write_string(&self.base_dn);
		writer.write_enumerated(self.scope.to_protocol());
		writer.write_enumerated(self.deref_aliases.to_protocol());
		writer.write_integer(i64::from(self.size_limit));
		writer.write_integer(i64::from(self.time_limit));
		writer.write_bool(self.types_only);
		self.filter.write_ber(writer);
		writer.write_constructed(SEQUENCE, |writer| {
			for attr in &self.attributes {
				writer.write_string(attr);
			}
		});
	}

	fn read_ber(reader: &mut BerReader<'_>) -> Result<Self, DecodeError> {
		let base_dn = reader.read_string()?;
		let scope = reader.read_enumerated()?;
		let scope = Scope::from_protocol(scope)
			.ok_or(DecodeError::InvalidEnumerated { what: "scope", value: scope })?;
		let deref = reader.read_enumerated()?;
		let deref_aliases = DerefAliases::from_protocol(deref)
			.ok_or(DecodeError::InvalidEnumerated { what: "derefAliases", value: deref })?;
		let size_limit = read_i32(reader)?;
		let time_limit = read_i32(reader)?;
		let types_only = reader.read_bool()?;
		let filter = Filter::read_ber(reader)?;
		let mut attrs = reader.read_constructed(SEQUENCE)?;
		let mut attributes = Vec::new();
		while !attrs.is_empty() {
			attributes.push(attrs.read_string()?);
		}
		Ok(Self { base_dn, scope, deref_aliases, size_limit, time_limit, types_only, filter, attributes })
	}
}

/// An `ExtendedRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
	/// OID of the operation.
	pub name: String,
	/// Operation specific payload.
	pub value: Option<Vec<u8>>,
}

/// An `ExtendedResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
	/// Outcome of the operation.
	pub result: LdapResult,
	/// OID of the response, if any.
	pub name: Option<String>,
	/// Operation specific payload.
	pub value: Option<Vec<u8>>,
}

/// A search as issued on a connection.
#[derive(Debug, Clone)]
pub struct SearchRequest {
	/// Message ID, unique on the connection.
	pub message_id: i32,
	/// What to search for.
	pub descriptor: QueryDescriptor,
	/// Limits and flags of the request.
	pub options: SearchConfig,
}

/// Encodes a `SearchRequest` message.
#[must_use]
pub fn encode_search_request(request: &SearchRequest) -> Vec<u8> {
	ProtocolMessage {
		message_id: request.message_id,
		operation: ProtocolOp::SearchRequest(SearchParameters::new(
			&request.descriptor,
			&request.options,
		)),
	}
	.encode()
}

impl ProtocolMessage {
	/// BER encoding of the message.
	#[must_use]
	pub fn encode(&self) -> Vec<u8> {
		let mut writer = BerWriter::new();
		writer.write_constructed(SEQUENCE, |writer| {
			writer.write_integer(i64::from(self.message_id));
			self.operation.write_ber(writer);
		});
		writer.into_bytes()
	}
}

impl ProtocolOp {
	fn write_ber(&self, writer: &mut BerWriter) {
		match self {
			ProtocolOp::BindRequest(bind) => writer.write_constructed(BIND_REQUEST, |writer| {
				writer.write_integer(i64::from(bind.version));
				writer.write_string(&bind.name);
				writer.write_element(SIMPLE_AUTH, bind.password.as_bytes());
			}),
			ProtocolOp::BindResponse(result) => {
				writer.write_constructed(BIND_RESPONSE, |writer| result.write_ber(writer));
			}
			ProtocolOp::UnbindRequest => writer.write_element(UNBIND_REQUEST, &[]),
			ProtocolOp::SearchRequest(params) => {
				writer.write_constructed(SEARCH_REQUEST, |writer| params.write_ber(writer));
			}
			ProtocolOp::SearchResultEntry(entry) => {
				writer.write_constructed(SEARCH_RESULT_ENTRY, |writer| {
					writer.write_string(&entry.dn);
					writer.write_constructed(SEQUENCE, |writer| {
						for (name, values) in &entry.attrs {
							writer.write_constructed(SEQUENCE, |writer| {
								writer.write_string(name);
								writer.write_constructed(SET, |writer| {
									for value in values {
										writer.write_octets(value);
									}
								});
							});
						}
					});
				});
			}
			ProtocolOp::SearchResultReference(urls) => {
				writer.write_constructed(SEARCH_RESULT_REFERENCE, |writer| {
					for url in urls {
						writer.write_string(url);
					}
				});
			}
			ProtocolOp::SearchResultDone(result) => {
				writer.write_constructed(SEARCH_RESULT_DONE, |writer| result.write_ber(writer));
			}
			ProtocolOp::ExtendedRequest(request) => {
				writer.write_constructed(EXTENDED_REQUEST, |writer| {
					writer.write_element(EXTENDED_REQUEST_NAME, request.name.as_bytes());
					if let Some(value) = &request.value {
						writer.write_element(EXTENDED_REQUEST_VALUE, value);
					}
				});
			}
			ProtocolOp::ExtendedResponse(response) => {
				writer.write_constructed(EXTENDED_RESPONSE, |writer| {
					response.result.write_ber(writer);
					if let Some(name) = &response.name {
						writer.write_element(EXTENDED_RESPONSE_NAME, name.as_bytes());
					}
					if let Some(value) = &response.value {
						writer.write_element(EXTENDED_RESPONSE_VALUE, value);
					}
				});
			}
		}
	}

	fn read_ber(reader: &mut BerReader<'_>) -> Result<Self, DecodeError> {
		let (tag, content) = reader.read_element()?;
		let mut inner = BerReader::new(content);
		let operation = match tag {
			UNBIND_REQUEST => ProtocolOp::UnbindRequest,
			BIND_REQUEST => {
				let version = inner.read_integer()?;
				let version = u8::try_from(version)
					.map_err(|_| DecodeError::InvalidEnumerated { what: "version", value: version })?;
				let name = inner.read_string()?;
				let password = inner.read_string_tagged(SIMPLE_AUTH)?;
				ProtocolOp::BindRequest(BindRequest { version, name, password })
			}
			BIND_RESPONSE => {
				let result = LdapResult::read_ber(&mut inner)?;
				inner.read_optional(SASL_CREDENTIALS)?;
				ProtocolOp::BindResponse(result)
			}
			SEARCH_REQUEST => ProtocolOp::SearchRequest(SearchParameters::read_ber(&mut inner)?),
			SEARCH_RESULT_ENTRY => ProtocolOp::SearchResultEntry(read_entry(&mut inner)?),
			SEARCH_RESULT_REFERENCE => {
				let mut urls = Vec::new();
				while !inner.is_empty() {
					urls.push(inner.read_string()?);
				}
				ProtocolOp::SearchResultReference(urls)
			}
			SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(LdapResult::read_ber(&mut inner)?),
			EXTENDED_REQUEST => {
				let name = inner.read_string_tagged(EXTENDED_REQUEST_NAME)?;
				let value = inner.read_optional(EXTENDED_REQUEST_VALUE)?.map(<[u8]>::to_vec);
				ProtocolOp::ExtendedRequest(ExtendedRequest { name, value })
			}
			EXTENDED_RESPONSE => {
				let result = LdapResult::read_ber(&mut inner)?;
				let name = if inner.peek_tag() == Some(EXTENDED_RESPONSE_NAME) {
					Some(inner.read_string_tagged(EXTENDED_RESPONSE_NAME)?)
				} else {
					None
				};
				let value = inner.read_optional(EXTENDED_RESPONSE_VALUE)?.map(<[u8]>::to_vec);
				ProtocolOp::ExtendedResponse(ExtendedResponse { result, name, value })
			}
			other => return Err(DecodeError::UnknownOperation(other)),
		};
		inner.finish()?;
		Ok(operation)
	}
}

/// Reads the body of a `SearchResultEntry`. Values of repeated attribute
/// descriptions are merged.
fn read_entry(reader: &mut BerReader<'_>) -> Result<Entry, DecodeError> {
	let dn = reader.read_string()?;
	let mut attributes = reader.read_constructed(SEQUENCE)?;
	let mut attrs: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
	while !attributes.is_empty() {
		let mut attribute = attributes.read_constructed(SEQUENCE)?;
		let name = attribute.read_string()?;
		let mut values = attribute.read_constructed(SET)?;
		let slot = attrs.entry(name).or_default();
		while !values.is_empty() {
			slot.push(values.read_tagged(OCTET_STRING)?.to_vec());
		}
		attribute.finish()?;
	}
	Ok(Entry { dn, attrs })
}

fn read_i32(reader: &mut BerReader<'_>) -> Result<i32, DecodeError> {
	i32::try_from(reader.read_integer()?).map_err(|_| DecodeError::InvalidInteger)
}

/// Outcome of [`decode_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
	/// A complete message was decoded.
	Message {
		/// The decoded message.
		message: ProtocolMessage,
		/// Number of bytes the message occupied at the start of the input.
		consumed: usize,
	},
	/// The input ends before the first message is complete.
	NeedMore,
}

/// Decodes the message at the start of `bytes`, with the default size limit.
pub fn decode_message(bytes: &[u8]) -> Result<Decoded, DecodeError> {
	decode_message_with_limit(bytes, DEFAULT_MAX_MESSAGE_SIZE)
}

/// Decodes the message at the start of `bytes`, rejecting messages whose
/// contents are longer than `max_message_size`.
pub fn decode_message_with_limit(
	bytes: &[u8],
	max_message_size: usize,
) -> Result<Decoded, DecodeError> {
	decode_frame(bytes, max_message_size, false)
}

/// Decodes the message at the start of `bytes`. With `responses_only`,
/// request operations are rejected before their bodies are read.
fn decode_frame(
	bytes: &[u8],
	max_message_size: usize,
	responses_only: bool,
) -> Result<Decoded, DecodeError> {
	let Some(header) = ber::parse_header(bytes)? else {
		return Ok(Decoded::NeedMore);
	};
	if header.tag != SEQUENCE {
		return Err(DecodeError::UnexpectedTag { expected: SEQUENCE, found: header.tag });
	}
	if header.len > max_message_size {
		return Err(DecodeError::MessageTooLarge { len: header.len, max: max_message_size });
	}
	let Some(frame) = bytes.get(..header.element_len()) else {
		return Ok(Decoded::NeedMore);
	};

	let mut reader = BerReader::new(frame).read_constructed(SEQUENCE)?;
	let id = reader.read_integer()?;
	let message_id =
		i32::try_from(id).ok().filter(|id| *id >= 0).ok_or(DecodeError::InvalidMessageId(id))?;
	if responses_only {
		if let Some(tag @ (BIND_REQUEST | UNBIND_REQUEST | SEARCH_REQUEST | EXTENDED_REQUEST)) =
			reader.peek_tag()
		{
			return Err(DecodeError::UnexpectedRequest(tag));
		}
	}
	let operation = ProtocolOp::read_ber(&mut reader)?;
	// Response controls are not interpreted
	reader.read_optional(CONTROLS)?;
	reader.finish()?;

	Ok(Decoded::Message {
		message: ProtocolMessage { message_id, operation },
		consumed: header.element_len(),
	})
}

/// Reassembles messages from arbitrarily chunked input.
#[derive(Debug)]
pub struct MessageDecoder {
	/// Received bytes not yet decoded.
	buffer: Vec<u8>,
	/// Largest accepted message.
	max_message_size: usize,
	/// Whether request operations are refused.
	responses_only: bool,
}

impl Default for MessageDecoder {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_MESSAGE_SIZE)
	}
}

impl MessageDecoder {
	/// Creates an empty decoder.
	#[must_use]
	pub fn new(max_message_size: usize) -> Self {
		Self { buffer: Vec::new(), max_message_size, responses_only: false }
	}

	/// Creates an empty decoder for the client side of a connection, which
	/// only accepts response and notification operations.
	#[must_use]
	pub fn for_responses(max_message_size: usize) -> Self {
		Self { buffer: Vec::new(), max_message_size, responses_only: true }
	}

	/// Appends received bytes.
	pub fn feed(&mut self, bytes: &[u8]) {
		self.buffer.extend_from_slice(bytes);
	}

	/// Decodes the next complete message, or returns `Ok(None)` if more
	/// input is needed.
	pub fn next_message(&mut self) -> Result<Option<ProtocolMessage>, DecodeError> {
		match decode_frame(&self.buffer, self.max_message_size, self.responses_only)? {
			Decoded::Message { message, consumed } => {
				self.buffer.drain(..consumed);
				Ok(Some(message))
			}
			Decoded::NeedMore => Ok(None),
		}
	}

	/// Number of buffered bytes.
	#[must_use]
	pub fn buffered(&self) -> usize {
		self.buffer.len()
	}
}
