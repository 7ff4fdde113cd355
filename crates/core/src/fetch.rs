//! Loading query images from URLs or local files.

use std::path::Path;

use image::DynamicImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to fetch {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to decode image from {origin}: {source}")]
    Decode {
        origin: String,
        #[source]
        source: image::ImageError,
    },
}

/// Sample images used by the demo flow.
pub const SAMPLE_FOOD_IMAGE: &str =
    "https://upload.wikimedia.org/wikipedia/commons/thumb/3/38/Chicken_Tikka_Masala.jpg/640px-Chicken_Tikka_Masala.jpg";
pub const SAMPLE_CAT_IMAGE: &str =
    "https://upload.wikimedia.org/wikipedia/commons/thumb/3/3a/Cat03.jpg/640px-Cat03.jpg";

/// Download and decode an image with a plain blocking GET. No retries.
pub fn image_from_url(url: &str) -> Result<DynamicImage, FetchError> {
    let http = |source| FetchError::Http {
        url: url.to_string(),
        source,
    };
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("vitlora/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(http)?;
    let response = client.get(url).send().map_err(http)?;
    if !response.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    let bytes = response.bytes().map_err(http)?;
    tracing::debug!(url, bytes = bytes.len(), "downloaded image");

    image::load_from_memory(&bytes).map_err(|source| FetchError::Decode {
        origin: url.to_string(),
        source,
    })
}

/// Load an image from a file path.
pub fn image_from_path(path: impl AsRef<Path>) -> Result<DynamicImage, FetchError> {
    let path = path.as_ref();
    image::open(path).map_err(|source| FetchError::Decode {
        origin: path.display().to_string(),
        source,
    })
}

/// `http://` and `https://` sources are downloaded, anything else is a path.
pub fn load_image(source: &str) -> Result<DynamicImage, FetchError> {
    if is_url(source) {
        image_from_url(source)
    } else {
        image_from_path(source)
    }
}

fn is_url(source: &str) -> bool {
    let lower = source.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
