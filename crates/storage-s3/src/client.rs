//! AWS SDK S3 client implementation.

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, MetadataDirective};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use rusty_transfer::{
    ByteRange, CompletedPart, ObjectAttributes, ObjectInfo, ObjectLocation, SessionToken,
    StoreClient, StoreError,
};

use crate::error::map_sdk_error;

/// Characters left unescaped in the `x-amz-copy-source` header.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Settings for `S3StoreClient`.
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// AWS region.
    pub region: String,
    /// Static credentials. The default provider chain is used when `None`.
    pub credentials: Option<S3Credentials>,
    /// Expected bucket owner, sent with every request when set.
    pub expected_bucket_owner: Option<String>,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            region: "us-west-2".into(),
            credentials: None,
            expected_bucket_owner: None,
        }
    }
}

/// AWS credentials.
#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// `StoreClient` implementation using the AWS SDK for Rust.
///
/// SDK-level retries are disabled: the transfer engine retries each part
/// under its own policy.
pub struct S3StoreClient {
    /// The underlying S3 client.
    s3_client: S3Client,
    /// Expected bucket owner for security validation.
    expected_bucket_owner: Option<String>,
}

impl S3StoreClient {
    /// Create a new S3 store client.
    ///
    /// # Arguments
    /// * `settings` - Region, optional credentials and expected bucket owner
    pub async fn new(settings: S3Settings) -> Self {
        let config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(settings.region.clone()))
            .retry_config(RetryConfig::disabled());

        let config_loader = if let Some(ref creds) = settings.credentials {
            let credentials = Credentials::new(
                &creds.access_key_id,
                &creds.secret_access_key,
                creds.session_token.clone(),
                None,
                "rusty-transfer",
            );
            config_loader.credentials_provider(credentials)
        } else {
            config_loader
        };

        let sdk_config = config_loader.load().await;
        Self {
            s3_client: S3Client::new(&sdk_config),
            expected_bucket_owner: settings.expected_bucket_owner,
        }
    }

    /// Create a client from an existing S3Client.
    ///
    /// # Arguments
    /// * `s3_client` - Pre-configured S3 client
    /// * `expected_bucket_owner` - Optional expected bucket owner
    pub fn from_client(s3_client: S3Client, expected_bucket_owner: Option<String>) -> Self {
        Self {
            s3_client,
            expected_bucket_owner,
        }
    }

    pub fn expected_bucket_owner(&self) -> Option<&str> {
        self.expected_bucket_owner.as_deref()
    }
}

/// `bucket/key` value for the copy-source header, with the key escaped.
pub fn copy_source(source: &ObjectLocation) -> String {
    format!(
        "{}/{}",
        source.bucket,
        utf8_percent_encode(&source.key, COPY_SOURCE)
    )
}

fn strip_quotes(e_tag: &str) -> String {
    e_tag.trim_matches('"').to_string()
}

fn missing(field: &str, location: &ObjectLocation) -> StoreError {
    StoreError::Other {
        message: format!("S3 response for {} did not include {}", location, field),
    }
}

#[async_trait]
impl StoreClient for S3StoreClient {
    async fn head_object(&self, location: &ObjectLocation) -> Result<ObjectInfo, StoreError> {
        let output = self
            .s3_client
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, location))?;

        let size: i64 = output
            .content_length()
            .ok_or_else(|| missing("Content-Length", location))?;
        Ok(ObjectInfo {
            size: size.max(0) as u64,
            e_tag: output.e_tag().map(strip_quotes),
        })
    }

    async fn put_object(
        &self,
        destination: &ObjectLocation,
        data: Bytes,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        let mut request = self
            .s3_client
            .put_object()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .body(ByteStream::from(data))
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .set_content_type(attributes.content_type.clone());

        for (k, v) in &attributes.metadata {
            request = request.metadata(k, v);
        }

        let output = request
            .send()
            .await
            .map_err(|err| map_sdk_error(err, destination))?;
        output
            .e_tag()
            .map(strip_quotes)
            .ok_or_else(|| missing("ETag", destination))
    }

    async fn get_object(&self, source: &ObjectLocation, range: ByteRange) -> Result<Bytes, StoreError> {
        if range.is_empty() && range.start > 0 {
            return Ok(Bytes::new());
        }

        let response = self
            .s3_client
            .get_object()
            .bucket(&source.bucket)
            .key(&source.key)
            .set_range(range.to_http_header())
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, source))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::NetworkError {
                message: format!("failed to read body of {}: {}", source, e),
                retryable: true,
            })?;
        Ok(data.into_bytes())
    }

    async fn copy_object(
        &self,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        let mut request = self
            .s3_client
            .copy_object()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .copy_source(copy_source(source))
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .set_expected_source_bucket_owner(self.expected_bucket_owner.clone());

        if !attributes.is_empty() {
            request = request
                .metadata_directive(MetadataDirective::Replace)
                .set_content_type(attributes.content_type.clone());
            for (k, v) in &attributes.metadata {
                request = request.metadata(k, v);
            }
        }

        let output = request
            .send()
            .await
            .map_err(|err| map_sdk_error(err, destination))?;
        output
            .copy_object_result()
            .and_then(|r| r.e_tag())
            .map(strip_quotes)
            .ok_or_else(|| missing("ETag", destination))
    }

    async fn create_multipart_upload(
        &self,
        destination: &ObjectLocation,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        let mut request = self
            .s3_client
            .create_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .set_content_type(attributes.content_type.clone());

        for (k, v) in &attributes.metadata {
            request = request.metadata(k, v);
        }

        let output = request
            .send()
            .await
            .map_err(|err| map_sdk_error(err, destination))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| missing("UploadId", destination))
    }

    async fn upload_part(
        &self,
        session: &SessionToken,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StoreError> {
        let destination: &ObjectLocation = &session.destination;
        let output = self
            .s3_client
            .upload_part()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(&session.upload_id)
            .part_number(part_number as i32)
            .content_length(data.len() as i64)
            .body(ByteStream::from(data))
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, destination))?;
        output
            .e_tag()
            .map(strip_quotes)
            .ok_or_else(|| missing("ETag", destination))
    }

    async fn upload_part_copy(
        &self,
        session: &SessionToken,
        part_number: u32,
        source: &ObjectLocation,
        range: ByteRange,
    ) -> Result<String, StoreError> {
        let destination: &ObjectLocation = &session.destination;
        let output = self
            .s3_client
            .upload_part_copy()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(&session.upload_id)
            .part_number(part_number as i32)
            .copy_source(copy_source(source))
            .set_copy_source_range(range.to_http_header())
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .set_expected_source_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, destination))?;
        output
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .map(strip_quotes)
            .ok_or_else(|| missing("ETag", destination))
    }

    async fn complete_multipart_upload(
        &self,
        session: &SessionToken,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        let destination: &ObjectLocation = &session.destination;
        let completed: Vec<aws_sdk_s3::types::CompletedPart> = parts
            .iter()
            .map(|p| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(format!("\"{}\"", p.e_tag))
                    .build()
            })
            .collect();

        self.s3_client
            .complete_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(&session.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, destination))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, session: &SessionToken) -> Result<(), StoreError> {
        let destination: &ObjectLocation = &session.destination;
        log::debug!(
            "aborting multipart upload {} for {}",
            session.upload_id,
            destination
        );
        self.s3_client
            .abort_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(&session.upload_id)
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, destination))?;
        Ok(())
    }
}
