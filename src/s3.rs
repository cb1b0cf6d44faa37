use crate::SmrError;
use crate::config::S3Config;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use tokio::runtime::Runtime;
use tracing::debug;

/// Lists object keys for `s3://` inputs, driving the async SDK on a private runtime.
pub struct S3Lister {
    client: Client,
    runtime: Runtime,
}

impl S3Lister {
    pub fn new(config: &S3Config) -> Result<Self, SmrError> {
        let runtime =
            Runtime::new().map_err(|e| SmrError::Other(format!("tokio runtime error: {}", e)))?;
        let region = Region::new(config.region.clone());
        let base_config = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(region.clone())
                .load(),
        );

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&base_config).region(region);
        if let Some(endpoint) = &config.endpoint {
            s3_builder = s3_builder.endpoint_url(endpoint);
            s3_builder = s3_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_builder.build()),
            runtime,
        })
    }

    /// All keys under `prefix`, following continuation tokens. Folder markers are skipped.
    pub fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, SmrError> {
        let mut token: Option<String> = None;
        let mut keys = Vec::new();

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);

            if let Some(ref cont) = token {
                request = request.continuation_token(cont);
            }

            let resp = self
                .runtime
                .block_on(request.send())
                .map_err(|e| SmrError::Input(format!("S3 list s3://{}/{}: {}", bucket, prefix, e)))?;

            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter(|key| !key.ends_with('/'))
                    .map(str::to_string),
            );

            if resp.is_truncated().unwrap_or(false) {
                token = resp.next_continuation_token().map(|s| s.to_string());
                debug!(bucket, prefix, listed = keys.len(), "listing next page");
            } else {
                break;
            }
        }

        Ok(keys)
    }
}
