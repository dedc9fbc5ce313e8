use s3::{creds::Credentials, error::S3Error, Bucket, Region};
use uuid::Uuid;

use crate::config::S3Config;

/// Image types accepted for popup media, with the extension stored objects get.
const ALLOWED_TYPES: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
];

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("unsupported content type '{0}'")]
    UnsupportedType(String),

    #[error("blob store error: {0}")]
    Store(#[from] S3Error),

    #[error("blob store rejected the upload with status {0}")]
    Rejected(u16),
}

/// Popup image storage on an S3-compatible bucket.
#[derive(Clone)]
pub struct MediaStore {
    bucket: Box<Bucket>,
    public_url: String,
}

impl MediaStore {
    pub fn from_config(config: &S3Config) -> anyhow::Result<Self> {
        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .region
                .parse::<Region>()
                .map_err(|e| anyhow::anyhow!("invalid S3_REGION '{}': {}", config.region, e))?,
        };

        let credentials = Credentials::new(
            config.access_key.as_deref(),
            config.secret_key.as_deref(),
            None,
            None,
            None,
        )
        .map_err(|e| anyhow::anyhow!("could not load S3 credentials: {}", e))?;

        let mut bucket = Bucket::new(&config.bucket, region, credentials)?;
        if config.endpoint.is_some() {
            bucket = bucket.with_path_style();
        }

        let public_url = config
            .public_url
            .clone()
            .unwrap_or_else(|| bucket.url().trim_end_matches('/').to_owned());

        Ok(Self { bucket, public_url })
    }

    /// Store an image under `popups/<owner>/` and return its public URL.
    pub async fn upload(
        &self,
        owner: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, MediaError> {
        let extension = extension_for(content_type)
            .ok_or_else(|| MediaError::UnsupportedType(content_type.to_owned()))?;

        let key = object_key(owner, extension);
        let response = self
            .bucket
            .put_object_with_content_type(&key, bytes, content_type)
            .await?;

        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(MediaError::Rejected(status));
        }

        tracing::info!("Uploaded {} ({} bytes)", key, bytes.len());
        Ok(format!("{}/{}", self.public_url, key))
    }
}

fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    ALLOWED_TYPES
        .iter()
        .find(|(mime, _)| mime.eq_ignore_ascii_case(essence))
        .map(|(_, ext)| *ext)
}

fn object_key(owner: &str, extension: &str) -> String {
    let owner: String = owner
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    format!("popups/{}/{}.{}", owner, Uuid::new_v4(), extension)
}
