use std::{error::Error, future::Future, sync::Arc, time::Duration};

use ldap_search::{
	codec::{LdapResult, MessageDecoder, ProtocolMessage, ProtocolOp},
	config::{Config, ConnectionConfig},
	Entry, ResultCode,
};
use rustls::{Certificate, PrivateKey, ServerConfig};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

pub fn init_tracing() {
	let tracing_filter = EnvFilter::default().add_directive(LevelFilter::DEBUG.into());
	let _ = tracing_subscriber::fmt().with_env_filter(tracing_filter).with_test_writer().try_init();
}

/// Client config with short timeouts
pub fn test_config() -> Config {
	Config {
		connection: ConnectionConfig {
			timeout: 5,
			operation_timeout: Duration::from_secs(5),
			..ConnectionConfig::default()
		},
		..Config::default()
	}
}

/// The server side of one accepted connection.
pub struct Peer {
	stream: TcpStream,
	decoder: MessageDecoder,
	/// Every request received, in order.
	pub received: Vec<ProtocolMessage>,
}

impl Peer {
	/// Next request, `None` once the client is gone.
	pub async fn recv(&mut self) -> Option<ProtocolMessage> {
		let mut buf = [0_u8; 1024];
		loop {
			if let Some(message) = self.decoder.next_message().expect("client sent malformed BER") {
				self.received.push(message.clone());
				return Some(message);
			}
			let n = self.stream.read(&mut buf).await.ok()?;
			if n == 0 {
				return None;
			}
			self.decoder.feed(&buf[..n]);
		}
	}

	/// Writes `bytes` in chunks of `chunk_size`, flushing after every chunk.
	pub async fn write_chunked(&mut self, bytes: &[u8], chunk_size: usize) {
		for chunk in bytes.chunks(chunk_size) {
			if self.stream.write_all(chunk).await.is_err() || self.stream.flush().await.is_err() {
				return;
			}
		}
	}

	pub async fn reply(&mut self, message_id: i32, operation: ProtocolOp) {
		let bytes = ProtocolMessage { message_id, operation }.encode();
		self.write_chunked(&bytes, bytes.len()).await;
	}

	/// Reads until the client closes the connection.
	pub async fn drain(&mut self) {
		while self.recv().await.is_some() {}
	}
}

/// Accepts a single connection on a loopback port and runs `handler` on it.
/// The join handle yields the requests the server received.
pub async fn serve<F, Fut>(handler: F) -> (u16, JoinHandle<Vec<ProtocolMessage>>)
where
	F: FnOnce(Peer) -> Fut + Send + 'static,
	Fut: Future<Output = Peer> + Send,
{
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let handle = tokio::spawn(async move {
		let (stream, _) = listener.accept().await.unwrap();
		let peer = Peer { stream, decoder: MessageDecoder::default(), received: Vec::new() };
		handler(peer).await.received
	});
	(port, handle)
}

/// Answers the first request with `replies`, written `chunk_size` bytes at a
/// time, then waits for the client to leave.
pub async fn answer_search(mut peer: Peer, replies: Vec<ProtocolOp>, chunk_size: usize) -> Peer {
	let Some(request) = peer.recv().await else {
		return peer;
	};
	let bytes: Vec<u8> = replies
		.into_iter()
		.flat_map(|operation| ProtocolMessage { message_id: request.message_id, operation }.encode())
		.collect();
	peer.write_chunked(&bytes, chunk_size).await;
	peer.drain().await;
	peer
}

/// What a TLS server saw of a client.
pub struct TlsServerLog {
	/// First byte the client sent, `0x16` for a TLS handshake record.
	pub first_byte: Option<u8>,
	/// Application data received once the handshake succeeded, `None` if it
	/// failed.
	pub plaintext: Option<Vec<u8>>,
}

/// Accepts a single connection and runs a TLS handshake with a self-signed
/// certificate for `localhost`.
pub async fn serve_self_signed_tls() -> (u16, JoinHandle<TlsServerLog>) {
	let mut pem = include_bytes!("../fixtures/self-signed.crt").as_slice();
	let certificates =
		rustls_pemfile::certs(&mut pem).unwrap().into_iter().map(Certificate).collect();
	let mut pem = include_bytes!("../fixtures/self-signed.key").as_slice();
	let key = rustls_pemfile::pkcs8_private_keys(&mut pem).unwrap().remove(0);
	let config = ServerConfig::builder()
		.with_safe_defaults()
		.with_no_client_auth()
		.with_single_cert(certificates, PrivateKey(key))
		.unwrap();
	let acceptor = TlsAcceptor::from(Arc::new(config));

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let handle = tokio::spawn(async move {
		let (stream, _) = listener.accept().await.unwrap();
		let mut first = [0_u8; 1];
		let first_byte = match stream.peek(&mut first).await {
			Ok(1) => Some(first[0]),
			_ => None,
		};
		let plaintext = match acceptor.accept(stream).await {
			Ok(mut tls) => {
				let mut received = Vec::new();
				let _ = tls.read_to_end(&mut received).await;
				Some(received)
			}
			Err(_) => None,
		};
		TlsServerLog { first_byte, plaintext }
	});
	(port, handle)
}

pub fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> ProtocolOp {
	ProtocolOp::SearchResultEntry(Entry {
		dn: dn.to_owned(),
		attrs: attrs
			.iter()
			.map(|(name, values)| {
				((*name).to_owned(), values.iter().map(|value| value.as_bytes().to_vec()).collect())
			})
			.collect(),
	})
}

pub fn done(code: ResultCode) -> ProtocolOp {
	ProtocolOp::SearchResultDone(LdapResult::new(code))
}

pub async fn ldap_add_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("ou={},dc=example,dc=org", ou),
		vec![("objectClass", ["organizationalUnit"].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("ou={},dc=example,dc=org", ou)).await?.success()?;
	Ok(())
}

pub async fn ldap_connect() -> Result<ldap3::Ldap, Box<dyn Error>> {
	let (conn, mut ldap) = ldap3::LdapConnAsync::new("ldap://localhost:1389").await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			panic!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind("cn=admin,dc=example,dc=org", "adminpassword").await?;
	Ok(ldap)
}

pub async fn ldap_delete_user(ldap: &mut ldap3::Ldap, cn: &str) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("cn={},ou=users,dc=example,dc=org", cn)).await?.success()?;
	Ok(())
}

pub async fn ldap_add_user(
	ldap: &mut ldap3::Ldap,
	cn: &str,
	display_name: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("cn={},ou=users,dc=example,dc=org", cn),
		vec![
			("objectClass", ["inetOrgPerson"].into()),
			("sn", [cn].into()),
			("displayName", [display_name].into()),
		],
	)
	.await?
	.success()?;
	Ok(())
}
