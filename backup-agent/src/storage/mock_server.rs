//! In-process Swift and S3 endpoints for storage tests.
//!
//! Objects live in one map keyed `{container or bucket}/{name}`. Every
//! mutating request is appended to a log so tests can check ordering, and
//! requests whose key contains the configured marker are refused.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

pub const SWIFT_ACCOUNT: &str = "/v1/AUTH_test";

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<String, Bytes>,
    /// Swift manifest object -> `{segments container}/{prefix}`.
    manifests: HashMap<String, String>,
    /// S3 multipart uploads in progress: key -> parts by number.
    uploads: HashMap<String, BTreeMap<u32, Bytes>>,
    log: Vec<String>,
    fail_on: Option<String>,
}

#[derive(Clone, Default)]
pub struct ObjectStore {
    state: Arc<Mutex<StoreState>>,
}

impl ObjectStore {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    /// Refuse writes to keys containing `marker`; S3 parts match as `part {n}`.
    pub fn fail_on(&self, marker: &str) {
        self.lock().fail_on = Some(marker.to_string());
    }

    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.lock().objects.get(key).cloned()
    }

    pub fn manifest(&self, key: &str) -> Option<String> {
        self.lock().manifests.get(key).cloned()
    }

    fn refuses(&self, key: &str) -> bool {
        self.lock()
            .fail_on
            .as_deref()
            .is_some_and(|marker| key.contains(marker))
    }

    fn record(&self, entry: String) {
        self.lock().log.push(entry);
    }

    /// Names under `{container}/` starting with `prefix` and sorting after `marker`.
    fn list(&self, container: &str, prefix: &str, marker: &str) -> Vec<String> {
        let scope = format!("{}/", container);
        self.lock()
            .objects
            .keys()
            .filter_map(|k| k.strip_prefix(&scope))
            .filter(|name| name.starts_with(prefix) && *name > marker)
            .map(str::to_string)
            .collect()
    }

    /// Swift account URL backed by this store.
    pub async fn serve_swift(&self) -> String {
        let app = Router::new().fallback(swift).with_state(self.clone());
        format!("{}{}", serve(app).await, SWIFT_ACCOUNT)
    }

    /// S3 endpoint (path-style) backed by this store.
    pub async fn serve_s3(&self) -> String {
        serve(Router::new().fallback(s3).with_state(self.clone())).await
    }
}

/// Serve `app` on an ephemeral port and return its base URL.
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    format!("http://{}", addr)
}

const S3_NS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

fn status(code: StatusCode) -> Response {
    code.into_response()
}

async fn swift(
    State(store): State<ObjectStore>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(path) = uri.path().strip_prefix(SWIFT_ACCOUNT) else {
        return status(StatusCode::NOT_FOUND);
    };
    let path = path.trim_start_matches('/').to_string();
    let is_object = path.contains('/');

    match method {
        Method::PUT if !is_object => status(StatusCode::CREATED),
        Method::PUT => {
            if store.refuses(&path) {
                return status(StatusCode::INTERNAL_SERVER_ERROR);
            }
            store.record(format!("PUT {}", path));
            let mut state = store.lock();
            if let Some(manifest) = headers.get("X-Object-Manifest").and_then(|v| v.to_str().ok()) {
                state.manifests.insert(path.clone(), manifest.to_string());
            }
            state.objects.insert(path, body);
            status(StatusCode::CREATED)
        }
        Method::GET if !is_object => {
            let prefix = query.get("prefix").map(String::as_str).unwrap_or("");
            let marker = query.get("marker").map(String::as_str).unwrap_or("");
            let names: Vec<_> = store
                .list(&path, prefix, marker)
                .into_iter()
                .map(|name| serde_json::json!({ "name": name }))
                .collect();
            Json(names).into_response()
        }
        Method::GET => {
            let state = store.lock();
            if let Some(manifest) = state.manifests.get(&path) {
                let data: Vec<u8> = state
                    .objects
                    .iter()
                    .filter(|(k, _)| k.starts_with(manifest.as_str()))
                    .flat_map(|(_, v)| v.to_vec())
                    .collect();
                return (StatusCode::OK, data).into_response();
            }
            match state.objects.get(&path) {
                Some(data) => (StatusCode::OK, data.clone()).into_response(),
                None => status(StatusCode::NOT_FOUND),
            }
        }
        Method::DELETE => {
            store.record(format!("DELETE {}", path));
            let mut state = store.lock();
            state.manifests.remove(&path);
            match state.objects.remove(&path) {
                Some(_) => status(StatusCode::NO_CONTENT),
                None => status(StatusCode::NOT_FOUND),
            }
        }
        _ => status(StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn xml(body: String) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/xml"));
    response
}

fn s3_error(code: StatusCode, kind: &str) -> Response {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Error><Code>{}</Code><Message>refused by test endpoint</Message><RequestId>1</RequestId></Error>",
        kind
    );
    let mut response = xml(body);
    *response.status_mut() = code;
    response
}

fn with_etag(etag: String) -> Response {
    let mut response = status(StatusCode::OK);
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert("etag", value);
    }
    response
}

async fn s3(
    State(store): State<ObjectStore>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let path = uri.path().trim_start_matches('/').to_string();
    let (bucket, key) = match path.split_once('/') {
        Some((bucket, key)) if !key.is_empty() => (bucket.to_string(), key.to_string()),
        _ => (path.trim_end_matches('/').to_string(), String::new()),
    };
    let full = format!("{}/{}", bucket, key);

    match method {
        Method::POST if query.contains_key("uploads") => {
            store.record(format!("create {}", key));
            store.lock().uploads.insert(full, BTreeMap::new());
            xml(format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <InitiateMultipartUploadResult xmlns=\"{}\"><Bucket>{}</Bucket><Key>{}</Key>\
                 <UploadId>upload-1</UploadId></InitiateMultipartUploadResult>",
                S3_NS, bucket, key
            ))
        }
        Method::PUT if query.contains_key("partNumber") => {
            let number: u32 = query["partNumber"].parse().unwrap_or(0);
            store.record(format!("part {} {}", number, key));
            if store.refuses(&format!("part {}", number)) {
                return s3_error(StatusCode::BAD_REQUEST, "InvalidRequest");
            }
            match store.lock().uploads.get_mut(&full) {
                Some(parts) => {
                    parts.insert(number, body);
                }
                None => return s3_error(StatusCode::NOT_FOUND, "NoSuchUpload"),
            }
            with_etag(format!("etag-{}", number))
        }
        Method::POST if query.contains_key("uploadId") => {
            store.record(format!("complete {}", key));
            let mut state = store.lock();
            let Some(parts) = state.uploads.remove(&full) else {
                return s3_error(StatusCode::NOT_FOUND, "NoSuchUpload");
            };
            let data: Vec<u8> = parts.into_values().flat_map(|p| p.to_vec()).collect();
            state.objects.insert(full, Bytes::from(data));
            xml(format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <CompleteMultipartUploadResult xmlns=\"{}\"><Bucket>{}</Bucket><Key>{}</Key>\
                 <ETag>\"done\"</ETag></CompleteMultipartUploadResult>",
                S3_NS, bucket, key
            ))
        }
        Method::DELETE if query.contains_key("uploadId") => {
            store.record(format!("abort {}", key));
            store.lock().uploads.remove(&full);
            status(StatusCode::NO_CONTENT)
        }
        Method::PUT => {
            if store.refuses(&key) {
                return s3_error(StatusCode::BAD_REQUEST, "InvalidRequest");
            }
            store.record(format!("put {}", key));
            store.lock().objects.insert(full, body);
            with_etag("single".to_string())
        }
        Method::GET if key.is_empty() => {
            let prefix = query.get("prefix").map(String::as_str).unwrap_or("");
            let contents: String = store
                .list(&bucket, prefix, "")
                .iter()
                .map(|k| format!("<Contents><Key>{}</Key><Size>0</Size></Contents>", k))
                .collect();
            xml(format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <ListBucketResult xmlns=\"{}\"><Name>{}</Name><Prefix>{}</Prefix><KeyCount>0</KeyCount>\
                 <MaxKeys>1000</MaxKeys><IsTruncated>false</IsTruncated>{}</ListBucketResult>",
                S3_NS, bucket, prefix, contents
            ))
        }
        Method::GET => match store.object(&full) {
            Some(data) => (StatusCode::OK, data).into_response(),
            None => s3_error(StatusCode::NOT_FOUND, "NoSuchKey"),
        },
        Method::HEAD => status(StatusCode::OK),
        Method::DELETE => {
            store.record(format!("delete {}", key));
            store.lock().objects.remove(&full);
            status(StatusCode::NO_CONTENT)
        }
        _ => status(StatusCode::METHOD_NOT_ALLOWED),
    }
}
