//! Connections to a directory server over TCP, optionally wrapped in TLS.
//!
//! A [`Connection`] owns its socket. The socket is released when the
//! connection is closed, fails, or is dropped, so every exit path of a search
//! gives it back. Closing through a [`CloseHandle`] interrupts a pending read,
//! which is how an outstanding search gets cancelled from another task or from
//! inside an entry callback.
use std::{
	fmt,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
	time::Duration,
};

use rustls::ServerName;
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
	net::TcpStream,
	sync::watch,
};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, info, warn};

use crate::{
	codec::{
		BindRequest, ExtendedRequest, MessageDecoder, ProtocolMessage, ProtocolOp,
		NOTICE_OF_DISCONNECTION_OID, START_TLS_OID,
	},
	config::{ConnectionConfig, TLSConfig},
	error::{ConnectionError, DecodeError, Error, ResultCode},
};

/// Size of the chunks read from the socket.
const READ_CHUNK: usize = 4096;

/// Lifecycle of a [`Connection`]. States only ever advance towards `Closed` or
/// `Failed`, both of which are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	/// TCP is up, TLS negotiation may still be running.
	Connecting,
	/// Ready to carry operations.
	Ready,
	/// Closed on request. The socket is released.
	Closed,
	/// Broken by an I/O, TLS or framing failure. The socket is released.
	Failed,
}

impl ConnectionState {
	fn can_become(self, next: ConnectionState) -> bool {
		matches!(
			(self, next),
			(ConnectionState::Connecting, ConnectionState::Ready)
				| (
					ConnectionState::Connecting | ConnectionState::Ready,
					ConnectionState::Closed | ConnectionState::Failed
				)
		)
	}

	/// Whether the connection can no longer be used.
	#[must_use]
	pub fn is_final(self) -> bool {
		matches!(self, ConnectionState::Closed | ConnectionState::Failed)
	}
}

/// Plain TCP (`ldap://`) or TLS (`ldaps://` and StartTLS).
enum Stream {
	Tcp(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match &mut *self {
			Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
			Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Stream {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		match &mut *self {
			Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
			Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
		}
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut *self {
			Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
			Stream::Tls(s) => Pin::new(s).poll_flush(cx),
		}
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut *self {
			Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
			Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
		}
	}
}

/// Closes a [`Connection`] from elsewhere, e.g. another task or an entry
/// callback. A pending read on the connection fails with [`Error::Cancelled`].
#[derive(Debug, Clone)]
pub struct CloseHandle {
	sender: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
	/// Request the connection to close.
	pub fn close(&self) {
		self.sender.send_replace(true);
	}

	/// Whether closing has been requested.
	#[must_use]
	pub fn is_closed(&self) -> bool {
		*self.sender.borrow()
	}
}

/// A connection to a directory server.
pub struct Connection {
	/// Host the connection was made to, also used as TLS server name.
	host: String,
	/// The socket, `None` once released.
	stream: Option<Stream>,
	state: ConnectionState,
	/// Bytes received but not yet framed into messages.
	decoder: MessageDecoder,
	/// Message ID of the next request, `None` once all are used. IDs increase
	/// strictly.
	next_message_id: Option<i32>,
	/// Timeout for a single read or write.
	operation_timeout: Duration,
	close_sender: Arc<watch::Sender<bool>>,
	close_receiver: watch::Receiver<bool>,
}

impl fmt::Debug for Connection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Connection")
			.field("host", &self.host)
			.field("state", &self.state)
			.field("tls", &self.is_tls())
			.field("next_message_id", &self.next_message_id)
			.finish_non_exhaustive()
	}
}

/// Opens a connection to `host:port`. With `use_tls` the TLS handshake
/// completes before the connection is returned. With `config.tls.starttls`
/// a plain connection is upgraded through StartTLS instead.
///
/// TLS failures are errors. There is no fallback to plaintext.
pub async fn connect(
	host: &str,
	port: u16,
	use_tls: bool,
	config: &ConnectionConfig,
) -> Result<Connection, Error> {
	let timeout = config.connect_timeout();
	debug!("Connecting to {host}:{port}");
	let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
		.await
		.map_err(|_| ConnectionError::Timeout(timeout))?
		.map_err(ConnectionError::Io)?;
	tcp.set_nodelay(true).map_err(ConnectionError::Io)?;

	let stream = if use_tls {
		let tls = tokio::time::timeout(timeout, tls_handshake(host, tcp, &config.tls))
			.await
			.map_err(|_| ConnectionError::Timeout(timeout))??;
		Stream::Tls(Box::new(tls))
	} else {
		Stream::Tcp(tcp)
	};

	let (close_sender, close_receiver) = watch::channel(false);
	let mut connection = Connection {
		host: host.to_owned(),
		stream: Some(stream),
		state: ConnectionState::Connecting,
		decoder: MessageDecoder::for_responses(config.max_message_size),
		next_message_id: Some(1),
		operation_timeout: config.operation_timeout,
		close_sender: Arc::new(close_sender),
		close_receiver,
	};

	if !use_tls && config.tls.starttls {
		if let Err(err) = connection.start_tls(&config.tls, timeout).await {
			connection.fail();
			return Err(err);
		}
	}

	connection.set_state(ConnectionState::Ready);
	info!("Connected to {host}:{port} (tls: {})", connection.is_tls());
	Ok(connection)
}

/// Resolves once closing is requested.
async fn closed(mut receiver: watch::Receiver<bool>) {
	// The sender lives as long as the connection, so an error cannot happen
	// while a read is pending
	let _ = receiver.wait_for(|closed| *closed).await;
}

/// Wraps `tcp` in a TLS session with `host` as server name.
async fn tls_handshake(
	host: &str,
	tcp: TcpStream,
	tls: &TLSConfig,
) -> Result<TlsStream<TcpStream>, ConnectionError> {
	let config = tls.client_config().await?;
	let server_name = ServerName::try_from(host)
		.map_err(|_| ConnectionError::InvalidServerName(host.to_owned()))?;
	debug!("Starting TLS handshake with {host}");
	TlsConnector::from(config).connect(server_name, tcp).await.map_err(|err| {
		warn!("TLS handshake with {host} failed: {err}");
		ConnectionError::Tls(err)
	})
}

impl Connection {
	/// Current lifecycle state.
	#[must_use]
	pub fn state(&self) -> ConnectionState {
		self.state
	}

	/// Host this connection was made to.
	#[must_use]
	pub fn host(&self) -> &str {
		&self.host
	}

	/// Whether traffic is protected by TLS.
	#[must_use]
	pub fn is_tls(&self) -> bool {
		matches!(self.stream, Some(Stream::Tls(_)))
	}

	/// A handle which closes this connection when triggered.
	#[must_use]
	pub fn close_handle(&self) -> CloseHandle {
		CloseHandle { sender: Arc::clone(&self.close_sender) }
	}

	fn set_state(&mut self, next: ConnectionState) {
		if self.state.can_become(next) {
			debug!("Connection to {}: {:?} -> {next:?}", self.host, self.state);
			self.state = next;
		}
	}

	/// Drops the socket.
	fn release(&mut self) {
		self.stream = None;
	}

	fn fail(&mut self) {
		self.release();
		self.set_state(ConnectionState::Failed);
	}

	/// Marks the connection closed on behalf of a [`CloseHandle`].
	fn cancel(&mut self) -> Error {
		debug!("Connection to {} closed while an operation was outstanding", self.host);
		self.release();
		self.set_state(ConnectionState::Closed);
		Error::Cancelled
	}

	fn close_requested(&self) -> bool {
		*self.close_receiver.borrow()
	}

	fn ensure_open(&mut self) -> Result<(), Error> {
		if self.state.is_final() {
			return Err(ConnectionError::Closed.into());
		}
		if self.close_requested() {
			return Err(self.cancel());
		}
		Ok(())
	}

	/// Hands out IDs up to and including `i32::MAX`, then fails.
	fn allocate_message_id(&mut self) -> Result<i32, ConnectionError> {
		let message_id = self.next_message_id.ok_or(ConnectionError::MessageIdsExhausted)?;
		self.next_message_id = message_id.checked_add(1);
		Ok(message_id)
	}

	/// Sends a request and returns the message ID it was sent with.
	pub(crate) async fn send(&mut self, operation: ProtocolOp) -> Result<i32, Error> {
		self.ensure_open()?;
		let message_id = self.allocate_message_id()?;
		let bytes = ProtocolMessage { message_id, operation }.encode();

		let timeout = self.operation_timeout;
		let stream = self.stream.as_mut().ok_or(ConnectionError::Closed)?;
		let written = tokio::time::timeout(timeout, async {
			stream.write_all(&bytes).await?;
			stream.flush().await
		})
		.await;
		match written {
			Ok(Ok(())) => Ok(message_id),
			Ok(Err(err)) => {
				self.fail();
				Err(ConnectionError::Io(err).into())
			}
			Err(_) => {
				self.fail();
				Err(ConnectionError::Timeout(timeout).into())
			}
		}
	}

	/// Reads the next complete message, whatever its message ID.
	pub(crate) async fn read_message(&mut self) -> Result<ProtocolMessage, Error> {
		self.ensure_open()?;
		let mut chunk = [0_u8; READ_CHUNK];
		loop {
			match self.decoder.next_message() {
				Ok(Some(message)) => return Ok(message),
				Ok(None) => {}
				Err(err) => {
					self.fail();
					return Err(err.into());
				}
			}

			let timeout = self.operation_timeout;
			let close_receiver = self.close_receiver.clone();
			let stream = self.stream.as_mut().ok_or(ConnectionError::Closed)?;
			let read = tokio::select! {
				biased;
				() = closed(close_receiver) => None,
				read = tokio::time::timeout(timeout, stream.read(&mut chunk)) => Some(read),
			};

			match read {
				None => return Err(self.cancel()),
				Some(Err(_)) => {
					self.fail();
					return Err(ConnectionError::Timeout(timeout).into());
				}
				Some(Ok(Err(err))) => {
					self.fail();
					return Err(ConnectionError::Io(err).into());
				}
				Some(Ok(Ok(0))) => {
					self.fail();
					return Err(ConnectionError::Eof.into());
				}
				Some(Ok(Ok(n))) => self.decoder.feed(&chunk[..n]),
			}
		}
	}

	/// Reads until the response to `message_id` arrives. Responses to other
	/// requests are skipped. An unsolicited notification ends the connection.
	pub(crate) async fn read_response(&mut self, message_id: i32) -> Result<ProtocolOp, Error> {
		loop {
			let message = self.read_message().await?;
			if message.message_id == message_id {
				return Ok(message.operation);
			}
			if message.message_id == 0 {
				return Err(self.unsolicited(message.operation));
			}
			warn!(
				"Ignoring message {} while waiting for message {message_id}",
				message.message_id
			);
		}
	}

	fn unsolicited(&mut self, operation: ProtocolOp) -> Error {
		self.fail();
		match operation {
			ProtocolOp::ExtendedResponse(response) => {
				if response.name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) {
					warn!("Server {} disconnected: {}", self.host, response.result.message);
				}
				Error::Protocol {
					code: response.result.code,
					matched_dn: response.result.matched_dn,
					message: response.result.message,
					referrals: response.result.referrals,
				}
			}
			_ => Error::protocol(ResultCode::ProtocolError, "Unexpected unsolicited message"),
		}
	}

	/// Upgrades the plain connection through the StartTLS extended operation.
	/// The TLS handshake must complete within `handshake_timeout`.
	async fn start_tls(
		&mut self,
		tls: &TLSConfig,
		handshake_timeout: Duration,
	) -> Result<(), Error> {
		debug!("Requesting StartTLS from {}", self.host);
		let message_id = self
			.send(ProtocolOp::ExtendedRequest(ExtendedRequest {
				name: START_TLS_OID.to_owned(),
				value: None,
			}))
			.await?;
		let ProtocolOp::ExtendedResponse(response) = self.read_response(message_id).await? else {
			return Err(Error::protocol(
				ResultCode::ProtocolError,
				"Unexpected response to StartTLS",
			));
		};
		if !response.result.code.is_success() {
			return Err(ConnectionError::StartTlsRefused(response.result.code).into());
		}
		// Nothing may be sent in plaintext after the response
		if self.decoder.buffered() > 0 {
			return Err(DecodeError::TrailingData.into());
		}

		let Some(Stream::Tcp(tcp)) = self.stream.take() else {
			return Err(ConnectionError::Closed.into());
		};
		let stream = tokio::time::timeout(handshake_timeout, tls_handshake(&self.host, tcp, tls))
			.await
			.map_err(|_| ConnectionError::Timeout(handshake_timeout))??;
		self.stream = Some(Stream::Tls(Box::new(stream)));
		info!("StartTLS with {} established", self.host);
		Ok(())
	}

	/// Performs an LDAPv3 simple bind.
	pub async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), Error> {
		let message_id = self
			.send(ProtocolOp::BindRequest(BindRequest {
				version: 3,
				name: dn.to_owned(),
				password: password.to_owned(),
			}))
			.await?;
		let ProtocolOp::BindResponse(result) = self.read_response(message_id).await? else {
			return Err(Error::protocol(ResultCode::ProtocolError, "Unexpected response to bind"));
		};
		result.success()?;
		debug!("Bound to {} as `{dn}`", self.host);
		Ok(())
	}

	/// Sends an unbind request if the connection is still usable, then
	/// releases the socket.
	pub async fn close(&mut self) {
		if self.state.is_final() {
			return;
		}
		if !self.close_requested() {
			match self.send(ProtocolOp::UnbindRequest).await {
				Ok(_) => {
					if let Some(stream) = self.stream.as_mut() {
						let timeout = self.operation_timeout;
						if tokio::time::timeout(timeout, stream.shutdown()).await.is_err() {
							debug!("Shutting down the connection to {} timed out", self.host);
						}
					}
				}
				Err(err) => debug!("Could not unbind from {}: {err}", self.host),
			}
		}
		self.release();
		self.set_state(ConnectionState::Closed);
		debug!("Connection to {} closed", self.host);
	}
}
