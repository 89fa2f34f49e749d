//! Turning request payloads into validated image bytes.
//!
//! Everything here runs before the quota ledger is touched, so every failure is an
//! [`ImageError`] the caller reports as an invalid image without charging anything.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
};
use bytes::{Bytes, BytesMut};
use reqwest::{
    Client,
    dns::{Addrs, Name, Resolve, Resolving},
    header::CONTENT_TYPE,
    redirect,
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, instrument};
use url::{Host, Url};

/// Raw image as it arrived on the request
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Uploaded bytes (multipart), with the part's declared content type if any
    Bytes { data: Bytes, content_type: Option<String> },
    /// Base64 text, optionally as a `data:<mime>;base64,` URL
    Base64(String),
    /// An http(s) URL to fetch
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("image is empty")]
    Empty,

    #[error("image is {size} bytes, the limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("payload is not a recognized image format")]
    UnsupportedFormat,

    #[error("image is not valid base64")]
    InvalidBase64,

    #[error("invalid image URL: {0}")]
    InvalidUrl(String),

    /// Connection failures, blocked hosts and non-2xx replies all look the same to the caller
    #[error("could not fetch image URL")]
    Fetch,
}

/// Image formats detected from magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
    Gif,
    Heic,
}

impl ImageFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Heic => "image/heic",
        }
    }

    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        const HEIF_BRANDS: [&[u8]; 8] = [b"heic", b"heix", b"heim", b"heis", b"hevc", b"hevx", b"mif1", b"msf1"];

        match bytes {
            [0xFF, 0xD8, 0xFF, ..] => Some(ImageFormat::Jpeg),
            [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n', ..] => Some(ImageFormat::Png),
            [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(ImageFormat::Gif),
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageFormat::Webp),
            [_, _, _, _, b'f', b't', b'y', b'p', brand @ ..] if brand.len() >= 4 && HEIF_BRANDS.iter().any(|b| *b == &brand[..4]) => {
                Some(ImageFormat::Heic)
            }
            _ => None,
        }
    }
}

/// Non-empty image bytes under the size limit, with the MIME type to present them as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedImage {
    bytes: Bytes,
    mime_type: String,
}

impl ValidatedImage {
    /// Validate `bytes`. The sniffed format wins over `declared`; an unsniffable payload is only
    /// accepted if it was declared as `image/*`.
    pub fn new(bytes: Bytes, declared: Option<&str>, max_bytes: usize) -> Result<Self, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        if bytes.len() > max_bytes {
            return Err(ImageError::TooLarge {
                size: bytes.len(),
                limit: max_bytes,
            });
        }

        let mime_type = match ImageFormat::sniff(&bytes) {
            Some(format) => format.mime_type().to_string(),
            None => declared
                .map(|d| d.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
                .filter(|d| d.starts_with("image/") && d.len() > "image/".len())
                .ok_or(ImageError::UnsupportedFormat)?,
        };

        Ok(Self { bytes, mime_type })
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// `data:<mime>;base64,<payload>`
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }
}

/// Whether `ip` is routable on the public internet. Loopback, private, link-local, shared (CGNAT),
/// unspecified, broadcast and documentation ranges are not.
fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || (a == 100 && (64..128).contains(&b)))
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_ip(IpAddr::V4(v4)),
            None => !(v6.is_loopback() || v6.is_unspecified() || v6.is_unique_local() || v6.is_unicast_link_local()),
        },
    }
}

fn literal_ip(url: &Url) -> Option<IpAddr> {
    match url.host()? {
        Host::Ipv4(ip) => Some(ip.into()),
        Host::Ipv6(ip) => Some(ip.into()),
        Host::Domain(_) => None,
    }
}

/// DNS resolver that refuses names resolving to any non-public address. Checking at resolution
/// time covers redirects and names that change answer between lookups.
struct PublicOnlyResolver;

impl Resolve for PublicOnlyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_public(name))
    }
}

async fn resolve_public(name: Name) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((name.as_str(), 0)).await?.collect();
    if addrs.is_empty() || addrs.iter().any(|addr| !is_public_ip(addr.ip())) {
        return Err(format!("{} does not resolve to a public address", name.as_str()).into());
    }
    let addrs: Addrs = Box::new(addrs.into_iter());
    Ok(addrs)
}

/// Resolves an [`ImageInput`] into a [`ValidatedImage`]
#[derive(Debug, Clone)]
pub struct ImageLoader {
    client: Client,
    max_bytes: usize,
    fetch_timeout: Duration,
    allow_private_hosts: bool,
}

impl ImageLoader {
    /// Unless `allow_private_hosts` is set, `image_url` may only reach public addresses, including
    /// through redirects.
    pub fn new(max_bytes: usize, fetch_timeout: Duration, allow_private_hosts: bool) -> reqwest::Result<Self> {
        let mut builder = Client::builder();
        if !allow_private_hosts {
            builder = builder
                .dns_resolver(Arc::new(PublicOnlyResolver))
                .redirect(redirect::Policy::custom(|attempt| {
                    if attempt.previous().len() >= 5 {
                        attempt.error("too many redirects")
                    } else if literal_ip(attempt.url()).is_some_and(|ip| !is_public_ip(ip)) {
                        attempt.error("redirect to a non-public address")
                    } else {
                        attempt.follow()
                    }
                }));
        }

        Ok(Self {
            client: builder.build()?,
            max_bytes,
            fetch_timeout,
            allow_private_hosts,
        })
    }

    #[instrument(skip_all, err(level = "debug"))]
    pub async fn load(&self, input: ImageInput) -> Result<ValidatedImage, ImageError> {
        match input {
            ImageInput::Bytes { data, content_type } => ValidatedImage::new(data, content_type.as_deref(), self.max_bytes),
            ImageInput::Base64(text) => self.decode_base64(&text),
            ImageInput::Url(url) => self.fetch(&url).await,
        }
    }

    fn decode_base64(&self, text: &str) -> Result<ValidatedImage, ImageError> {
        let text = text.trim();
        let (declared, payload) = match text.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest.split_once(',').ok_or(ImageError::InvalidBase64)?;
                let mime = header.strip_suffix(";base64").ok_or(ImageError::InvalidBase64)?;
                (Some(mime), payload)
            }
            None => (None, text),
        };

        let payload: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        if payload.is_empty() {
            return Err(ImageError::Empty);
        }
        // Reject before allocating the decoded buffer
        let decoded_size = payload.len() / 4 * 3;
        if decoded_size > self.max_bytes + 3 {
            return Err(ImageError::TooLarge {
                size: decoded_size,
                limit: self.max_bytes,
            });
        }

        let bytes = STANDARD
            .decode(&payload)
            .or_else(|_| STANDARD_NO_PAD.decode(&payload))
            .map_err(|_| ImageError::InvalidBase64)?;
        ValidatedImage::new(Bytes::from(bytes), declared, self.max_bytes)
    }

    #[instrument(skip(self), err(level = "debug"))]
    async fn fetch(&self, url: &str) -> Result<ValidatedImage, ImageError> {
        let url = Url::parse(url.trim()).map_err(|e| ImageError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ImageError::InvalidUrl(format!("unsupported scheme '{}'", url.scheme())));
        }
        // IP literals never reach the resolver
        if !self.allow_private_hosts
            && let Some(ip) = literal_ip(&url)
            && !is_public_ip(ip)
        {
            debug!(%ip, "Refusing to fetch image from a non-public address");
            return Err(ImageError::Fetch);
        }

        let mut response = self.client.get(url).timeout(self.fetch_timeout).send().await.map_err(|e| {
            debug!(error = %e, "Image fetch failed");
            ImageError::Fetch
        })?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "Image URL returned an error status");
            return Err(ImageError::Fetch);
        }
        if let Some(length) = response.content_length()
            && length > self.max_bytes as u64
        {
            return Err(ImageError::TooLarge {
                size: usize::try_from(length).unwrap_or(usize::MAX),
                limit: self.max_bytes,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Content-Length can be absent or wrong, so enforce the limit while reading
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            debug!(error = %e, "Image download failed");
            ImageError::Fetch
        })? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(ImageError::TooLarge {
                    size: body.len() + chunk.len(),
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(bytes = body.len(), content_type = ?content_type, "Fetched image");
        ValidatedImage::new(body.freeze(), content_type.as_deref(), self.max_bytes)
    }
}
