//! Submission transport: one multipart POST per instance.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::multipart::{Form, Part};
use reqwest::redirect::Policy;
use tracing::debug;

use crate::errors::CollectResult;
use crate::upload::descriptor::InstanceDescriptor;
use crate::upload::payload::SubmissionPayload;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest silence tolerated between reads. A slow link that keeps making
/// progress is never cut off.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

pub const SURVEY_LOCATION_HEADER: &str = "x-applab-survey-location";
pub const INTERVIEWEE_ID_HEADER: &str = "x-applab-interviewee-id";

/// Status the server must answer with for a stored submission.
pub const CREATED: u16 = 201;

/// What the server said about one submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionResponse {
    pub status: u16,
    pub location: Option<String>,
}

impl SubmissionResponse {
    pub fn new(status: u16, location: Option<&str>) -> Self {
        Self {
            status,
            location: location.map(str::to_string),
        }
    }

    /// A submission counts as stored only on `201 Created` with a Location
    /// that points back at `endpoint`.
    pub fn is_confirmed_for(&self, endpoint: &str) -> bool {
        self.status == CREATED
            && self
                .location
                .as_deref()
                .is_some_and(|location| location_matches(endpoint, location))
    }
}

/// Whether `location` names `endpoint` itself (as a substring) or a
/// resource nested under it.
pub fn location_matches(endpoint: &str, location: &str) -> bool {
    if location.is_empty() {
        return false;
    }
    if endpoint.contains(location) {
        return true;
    }
    let base = endpoint.trim_end_matches('/');
    location
        .strip_prefix(base)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
pub trait SubmissionTransport: Send + Sync {
    async fn submit(
        &self,
        endpoint: &str,
        descriptor: &InstanceDescriptor,
        payload: &SubmissionPayload,
    ) -> CollectResult<SubmissionResponse>;
}

/// reqwest-backed transport. Redirects are never followed so the
/// Location of the first answer is what gets checked.
pub struct HttpTransport {
    client: reqwest::Client,
    common_headers: BTreeMap<String, String>,
}

impl HttpTransport {
    pub fn new(common_headers: BTreeMap<String, String>) -> CollectResult<Self> {
        Self::with_timeouts(common_headers, CONNECT_TIMEOUT, READ_TIMEOUT)
    }

    pub fn with_timeouts(
        common_headers: BTreeMap<String, String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> CollectResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self {
            client,
            common_headers,
        })
    }

    async fn build_form(payload: &SubmissionPayload) -> CollectResult<Form> {
        let mut form = Form::new();
        for part in &payload.parts {
            let bytes = tokio::fs::read(&part.path).await?;
            let body = Part::bytes(bytes)
                .file_name(part.file_name.clone())
                .mime_str(part.content_type)?;
            form = form.part(part.name.clone(), body);
        }
        Ok(form)
    }
}

#[async_trait]
impl SubmissionTransport for HttpTransport {
    async fn submit(
        &self,
        endpoint: &str,
        descriptor: &InstanceDescriptor,
        payload: &SubmissionPayload,
    ) -> CollectResult<SubmissionResponse> {
        let form = Self::build_form(payload).await?;

        let mut request = self
            .client
            .post(endpoint)
            .header(SURVEY_LOCATION_HEADER, descriptor.location.as_str())
            .header(INTERVIEWEE_ID_HEADER, descriptor.interviewee_id.as_str());
        for (name, value) in &self.common_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.multipart(form).send().await?;
        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(
            "POST {endpoint} for {}: {status} location={location:?}",
            descriptor.instance_path.display()
        );
        Ok(SubmissionResponse { status, location })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::payload::build_payload;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_location_matches() {
        let endpoint = "https://host/submissions";
        assert!(location_matches(endpoint, "https://host/submissions"));
        assert!(location_matches(endpoint, "https://host/submissions/42"));
        assert!(location_matches(endpoint, "host/submissions"));
        assert!(!location_matches(endpoint, "https://host/submissions42"));
        assert!(!location_matches(endpoint, "https://evil/submissions/42"));
        assert!(!location_matches(endpoint, ""));
    }

    #[test]
    fn test_confirmation_needs_created_and_location() {
        let endpoint = "https://host/submissions";
        let ok = SubmissionResponse::new(201, Some("https://host/submissions/1"));
        assert!(ok.is_confirmed_for(endpoint));
        assert!(!SubmissionResponse::new(200, Some("https://host/submissions/1"))
            .is_confirmed_for(endpoint));
        assert!(!SubmissionResponse::new(201, None).is_confirmed_for(endpoint));
    }

    fn instance_fixture() -> (tempfile::TempDir, InstanceDescriptor) {
        let dir = tempfile::tempdir().unwrap();
        let inst = dir.path().join("survey_[AB1234]_2020-01-01_10-00-00");
        std::fs::create_dir(&inst).unwrap();
        let manifest = inst.join("survey_[AB1234]_2020-01-01_10-00-00.xml");
        std::fs::write(&manifest, "<data/>").unwrap();
        std::fs::write(inst.join("photo.jpg"), [0xffu8, 0xd8]).unwrap();
        (dir, InstanceDescriptor::new("AB1234", "Gulu", manifest))
    }

    #[tokio::test]
    async fn test_http_submit_sends_headers_and_parts() {
        let server = MockServer::start().await;
        let endpoint = format!("{}/submissions", server.uri());
        Mock::given(method("POST"))
            .and(path("/submissions"))
            .and(header(INTERVIEWEE_ID_HEADER, "AB1234"))
            .and(header(SURVEY_LOCATION_HEADER, "Gulu"))
            .and(header("x-device", "phone-7"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("Location", format!("{endpoint}/42").as_str()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, descriptor) = instance_fixture();
        let payload = build_payload(&descriptor.instance_path).unwrap();
        let headers = BTreeMap::from([("x-device".to_string(), "phone-7".to_string())]);
        let transport = HttpTransport::new(headers).unwrap();

        let response = transport
            .submit(&endpoint, &descriptor, &payload)
            .await
            .unwrap();
        assert_eq!(response.status, 201);
        assert!(response.is_confirmed_for(&endpoint));

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("name=\"xml_submission_file\""));
        assert!(body.contains("filename=\"photo.jpg\""));
        assert!(body.contains("text/xml"));
    }

    /// One-shot HTTP server on a free port: reads a full request, then
    /// writes the chunks built for its endpoint with `gap` between them.
    async fn trickling_server(
        chunks_for: impl FnOnce(&str) -> Vec<String>,
        gap: Duration,
    ) -> (String, tokio::task::JoinHandle<()>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/submission", listener.local_addr().unwrap());
        let chunks = chunks_for(&endpoint);
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&request) {
                    break;
                }
            }
            for chunk in chunks {
                if socket.write_all(chunk.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
                tokio::time::sleep(gap).await;
            }
        });
        (endpoint, server)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let head = text[..head_end].to_lowercase();
        let body_len = raw.len() - (head_end + 4);
        match head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            Some(expected) => body_len >= expected,
            None => text.ends_with("0\r\n\r\n"),
        }
    }

    #[tokio::test]
    async fn test_slow_but_steady_response_is_not_cut_off() {
        // 9 writes 150ms apart: the whole answer takes well over the 500ms
        // read timeout, but no single gap does.
        let (endpoint, server) = trickling_server(
            |endpoint| {
                let mut chunks = vec!["HTTP/1.1 201 Created\r\n".to_string()];
                for i in 0..8 {
                    chunks.push(format!("x-pad-{i}: {i}\r\n"));
                }
                chunks.push(format!(
                    "location: {endpoint}/7\r\ncontent-length: 0\r\n\r\n"
                ));
                chunks
            },
            Duration::from_millis(150),
        )
        .await;

        let (_dir, descriptor) = instance_fixture();
        let payload = build_payload(&descriptor.instance_path).unwrap();
        let transport = HttpTransport::with_timeouts(
            BTreeMap::new(),
            Duration::from_secs(5),
            Duration::from_millis(500),
        )
        .unwrap();

        let started = std::time::Instant::now();
        let response = transport
            .submit(&endpoint, &descriptor, &payload)
            .await
            .unwrap();
        assert!(started.elapsed() > Duration::from_millis(1000));
        assert_eq!(response.status, 201);
        assert_eq!(
            response.location.as_deref(),
            Some(format!("{endpoint}/7").as_str())
        );
        assert!(response.is_confirmed_for(&endpoint));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_response_hits_read_timeout() {
        let (endpoint, _server) = trickling_server(
            |_| {
                vec![
                    "HTTP/1.1 201 Created\r\n".to_string(),
                    "content-length: 0\r\n\r\n".to_string(),
                ]
            },
            Duration::from_secs(3),
        )
        .await;

        let (_dir, descriptor) = instance_fixture();
        let payload = build_payload(&descriptor.instance_path).unwrap();
        let transport = HttpTransport::with_timeouts(
            BTreeMap::new(),
            Duration::from_secs(5),
            Duration::from_millis(300),
        )
        .unwrap();

        let result = transport.submit(&endpoint, &descriptor, &payload).await;
        assert!(matches!(result, Err(crate::errors::CollectError::Http(_))));
    }

    #[tokio::test]
    async fn test_http_submit_does_not_follow_redirects() {
        let server = MockServer::start().await;
        let endpoint = format!("{}/submission", server.uri());
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", format!("{}/elsewhere", server.uri()).as_str()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, descriptor) = instance_fixture();
        let payload = build_payload(&descriptor.instance_path).unwrap();
        let transport = HttpTransport::new(BTreeMap::new()).unwrap();
        let response = transport
            .submit(&endpoint, &descriptor, &payload)
            .await
            .unwrap();
        assert_eq!(response.status, 302);
        assert!(!response.is_confirmed_for(&endpoint));
    }
}
