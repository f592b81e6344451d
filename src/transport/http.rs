use std::future::Future;
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, ETAG, LOCATION};
use reqwest::{Body, Client, Response};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use crate::core::{ByteProgress, ChunkEtag, FileRef, TransferError, Transport, UploadError, UploadId};
use super::progress_stream::ProgressStream;

/// 流式请求体每片的大小
const BODY_PART_SIZE: usize = 64 * 1024;

const UPLOAD_ID_HEADER: &str = "x-upload-id";
const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
const METADATA_HEADER: &str = "x-upload-metadata";

#[derive(Serialize)]
struct FinalizeRequest<'a> {
    upload_id: String,
    filename: &'a str,
    size: u64,
    mime_type: &'a str,
    chunks: Vec<FinalizeChunk<'a>>,
}

#[derive(Serialize)]
struct FinalizeChunk<'a> {
    index: usize,
    etag: &'a str,
}

/// 基于 HTTP 的传输层
///
/// - 整文件：`POST {endpoint}`，流式请求体
/// - 分片：`PUT {endpoint}/chunk`，响应头 `ETag` 作为分片标识
/// - 合并：`POST {endpoint}/complete`，JSON 请求体
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Result<Self, UploadError> {
        Self::with_client(Client::new(), endpoint)
    }

    pub fn with_client(client: Client, endpoint: &str) -> Result<Self, UploadError> {
        let endpoint = Url::parse(endpoint).map_err(|err| UploadError::Config(format!("invalid endpoint {endpoint}: {err}")))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.endpoint.as_str().trim_end_matches('/'))
    }

    /// `filename <base64>,filetype <base64>`
    pub fn metadata_header(file: &FileRef) -> String {
        format!(
            "filename {},filetype {}",
            BASE64_STANDARD.encode(&file.name),
            BASE64_STANDARD.encode(&file.mime_type)
        )
    }

    fn headers(upload_id: UploadId, file: Option<&FileRef>) -> Result<HeaderMap, TransferError> {
        let mut headers = HeaderMap::new();
        headers.insert(UPLOAD_ID_HEADER, header_value(&upload_id.to_string())?);
        if let Some(file) = file {
            headers.insert(METADATA_HEADER, header_value(&Self::metadata_header(file))?);
        }
        Ok(headers)
    }

    /// 从 `Location` 头或 JSON 的 `url` 字段取得文件地址
    async fn resolve_url(&self, response: Response) -> Result<String, TransferError> {
        if let Some(location) = response.headers().get(LOCATION) {
            let location = location
                .to_str()
                .map_err(|err| TransferError::server(response.status().as_u16(), format!("invalid location header: {err}")))?;
            return self
                .endpoint
                .join(location)
                .map(String::from)
                .map_err(|err| TransferError::server(response.status().as_u16(), format!("invalid location {location}: {err}")));
        }

        let status = response.status().as_u16();
        let body: serde_json::Value = response.json().await?;
        body["url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| TransferError::server(status, "no url in response"))
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TransferError> {
    HeaderValue::from_str(value).map_err(|err| TransferError::io(format!("invalid header value: {err}")))
}

/// 非 2xx 视为服务端错误
fn check_status(response: Response, action: &str) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TransferError::server(status.as_u16(), format!("{action} failed: {status}")))
    }
}

/// 取消时立即返回
async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T, TransferError>>,
) -> Result<T, TransferError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TransferError::cancelled()),
        result = future => result,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload_whole(
        &self,
        upload_id: UploadId,
        file: &FileRef,
        progress: ByteProgress,
        cancel: CancellationToken,
    ) -> Result<String, TransferError> {
        let data = file.read_all().await?;
        let parts: Vec<std::io::Result<Bytes>> = (0..data.len())
            .step_by(BODY_PART_SIZE)
            .map(|start| Ok(data.slice(start..(start + BODY_PART_SIZE).min(data.len()))))
            .collect();
        let body = Body::wrap_stream(ProgressStream::new(futures_util::stream::iter(parts), progress));

        let mut headers = Self::headers(upload_id, Some(file))?;
        headers.insert(CONTENT_TYPE, header_value(&file.mime_type)?);

        debug!(%upload_id, url = %self.endpoint, size = file.size, "POST whole file");

        cancellable(&cancel, async {
            let response = self
                .client
                .post(self.endpoint.clone())
                .headers(headers)
                .body(body)
                .send()
                .await?;
            let response = check_status(response, "upload")?;
            self.resolve_url(response).await
        })
        .await
    }

    async fn upload_chunk(
        &self,
        upload_id: UploadId,
        chunk_index: usize,
        bytes: Bytes,
        cancel: CancellationToken,
    ) -> Result<String, TransferError> {
        let mut headers = Self::headers(upload_id, None)?;
        headers.insert(CHUNK_INDEX_HEADER, header_value(&chunk_index.to_string())?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));

        cancellable(&cancel, async {
            let response = self
                .client
                .put(self.url("chunk"))
                .headers(headers)
                .body(bytes)
                .send()
                .await?;
            let response = check_status(response, "chunk upload")?;

            response
                .headers()
                .get(ETAG)
                .and_then(|value| value.to_str().ok())
                .map(|etag| etag.trim_matches('"').to_string())
                .ok_or_else(|| TransferError::server(response.status().as_u16(), "no ETag in chunk response"))
        })
        .await
        .map_err(|err| err.with_chunk(chunk_index))
    }

    async fn finalize_chunks(
        &self,
        upload_id: UploadId,
        file: &FileRef,
        etags: Vec<ChunkEtag>,
        cancel: CancellationToken,
    ) -> Result<String, TransferError> {
        let request = FinalizeRequest {
            upload_id: upload_id.to_string(),
            filename: &file.name,
            size: file.size,
            mime_type: &file.mime_type,
            chunks: etags
                .iter()
                .map(|etag| FinalizeChunk { index: etag.index, etag: &etag.etag })
                .collect(),
        };
        let headers = Self::headers(upload_id, Some(file))?;

        debug!(%upload_id, chunks = etags.len(), "POST complete");

        cancellable(&cancel, async {
            let response = self
                .client
                .post(self.url("complete"))
                .headers(headers)
                .json(&request)
                .send()
                .await?;
            let response = check_status(response, "finalize")?;
            self.resolve_url(response).await
        })
        .await
    }

    fn reports_progress(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_endpoint() {
        assert!(matches!(HttpTransport::new("not a url"), Err(UploadError::Config(_))));
    }

    #[test]
    fn test_chunk_urls() {
        let transport = HttpTransport::new("http://localhost:8080/uploads/").unwrap();
        assert_eq!(transport.url("chunk"), "http://localhost:8080/uploads/chunk");
        assert_eq!(transport.url("complete"), "http://localhost:8080/uploads/complete");
    }

    #[test]
    fn test_metadata_header() {
        let file = FileRef::from_bytes("a.txt", b"hi".to_vec());
        let header = HttpTransport::metadata_header(&file);
        assert_eq!(header, "filename YS50eHQ=,filetype dGV4dC9wbGFpbg==");
    }

    #[test]
    fn test_finalize_request_body() {
        let request = FinalizeRequest {
            upload_id: "id".into(),
            filename: "a.bin",
            size: 3,
            mime_type: "application/octet-stream",
            chunks: vec![FinalizeChunk { index: 0, etag: "x" }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["chunks"][0]["etag"], "x");
        assert_eq!(json["size"], 3);
    }
}
