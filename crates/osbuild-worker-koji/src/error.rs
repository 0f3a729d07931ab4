//! Errors of the Koji client.

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The hub URL could not be parsed.
    #[snafu(display("invalid koji server url {url}: {source}"))]
    InvalidServer { url: String, source: url::ParseError },

    /// Transport failure.
    #[snafu(display("request to {url} failed: {source}"))]
    Http { url: String, source: reqwest::Error },

    /// Non-2xx reply from the hub.
    #[snafu(display("{url} returned {status}"))]
    Status { url: String, status: u16 },

    /// The hub answered with an XML-RPC fault.
    #[snafu(display("xmlrpc fault {code}: {message}"))]
    Fault { code: i64, message: String },

    /// The reply is not well-formed XML-RPC.
    #[snafu(display("malformed xmlrpc document: {reason}"))]
    Xml { reason: String },

    /// A reply value does not have the expected shape.
    #[snafu(display("unexpected xmlrpc value for {what}: {reason}"))]
    Decode { what: String, reason: String },

    /// The hub received a different number of bytes than were sent.
    #[snafu(display("Sent a chunk of {sent} bytes, but server got {got} bytes"))]
    ChunkSize { sent: usize, got: i64 },

    /// The hub computed a different Adler-32 digest.
    #[snafu(display("Sent a chunk with Adler32 digest {sent}, but server computed digest {got}"))]
    ChunkDigest { sent: String, got: String },

    /// Reading the local file failed.
    #[snafu(display("failed to read upload source: {source}"))]
    ReadSource { source: std::io::Error },

    /// Serializing content-generator metadata failed.
    #[snafu(display("failed to encode build metadata: {source}"))]
    EncodeMetadata { source: serde_json::Error },

    /// Kerberos login failed.
    #[snafu(display("gssapi login failed: {reason}"))]
    Gssapi { reason: String },

    /// The private Kerberos credential cache could not be created.
    #[snafu(display("failed to create kerberos credential cache: {source}"))]
    CredentialCache { source: std::io::Error },

    /// A helper of the Kerberos login could not be run.
    #[snafu(display("failed to run {program}: {source}"))]
    LoginHelper { program: String, source: std::io::Error },

    /// The `sslLogin` reply is not UTF-8.
    #[snafu(display("sslLogin reply is not utf-8: {source}"))]
    LoginReply { source: std::string::FromUtf8Error },

    /// Building the HTTP client failed.
    #[snafu(display("failed to build http client: {source}"))]
    BuildClient { source: reqwest::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
