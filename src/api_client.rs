use anyhow::{anyhow, bail, Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::assistant::{
    AssistantBackend, AssistantRequest, AssistantResponse, HistoryLog, HistoryResponse,
};
use crate::csrf::{CsrfAccessor, CsrfSettings};
use crate::data_exporter::RenderedTable;
use crate::page::FormSubmitter;
use crate::query_list::FavoriteResponse;
use crate::schema_cache::{Schema, SchemaSource};
use crate::uploads::{ProgressReader, UploadResponse, ValidationResult};

/// Characters escaped inside a single path segment
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Deserialize)]
struct FormatResponse {
    formatted: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailResponse {
    #[serde(default)]
    pub message: Option<String>,
}

/// HTTP client for one explorer deployment.
pub struct ExplorerClient {
    base_url: Url,
    client: Client,
    jar: Arc<Jar>,
    csrf: Mutex<CsrfAccessor>,
    last_page: Mutex<Option<String>>,
}

impl ExplorerClient {
    pub fn new(base_url: &str, csrf: CsrfSettings, timeout: Duration) -> Result<Self> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("Invalid base URL: {}", base))?;

        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url,
            client,
            jar,
            csrf: Mutex::new(CsrfAccessor::new(csrf)),
            last_page: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Cannot build URL for '{}'", path))
    }

    fn segment(value: &str) -> String {
        utf8_percent_encode(value, SEGMENT).to_string()
    }

    fn csrf_token(&self) -> Option<String> {
        let cookies = self
            .jar
            .cookies(&self.base_url)
            .and_then(|h| h.to_str().ok().map(str::to_string));
        let page = self.last_page.lock().ok().and_then(|p| p.clone());
        let accessor = self.csrf.lock().ok()?;
        accessor.token(cookies.as_deref(), page.as_deref())
    }

    fn with_csrf(&self, request: RequestBuilder) -> RequestBuilder {
        match self.csrf_token() {
            Some(token) => request.header("X-CSRFToken", token),
            None => {
                debug!(target: "api", "No CSRF token available for request");
                request
            }
        }
    }

    fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let detail = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string));
            match detail {
                Some(detail) => bail!("HTTP error! Status: {} ({})", status, detail),
                None => bail!("HTTP error! Status: {}", status),
            }
        }
        Ok(response)
    }

    /// Loads a page, keeping it as the source of CSRF settings and of the
    /// hidden token field.
    pub fn get_page(&self, path: &str) -> Result<String> {
        let url = self.url(path)?;
        debug!(target: "api", "GET {}", url);
        let body = Self::check(self.client.get(url).send()?)?.text()?;
        self.remember_page(&body);
        Ok(body)
    }

    /// Posts an editor form (save, run, create or playground) and returns
    /// the page the server lands on.
    pub fn submit_query(&self, path: &str, fields: &[(String, String)]) -> Result<String> {
        let url = self.url(path)?;
        debug!(target: "api", "POST {}", url);
        let request = self.client.post(url).form(fields);
        let body = Self::check(self.with_csrf(request).send()?)?.text()?;
        self.remember_page(&body);
        Ok(body)
    }

    fn remember_page(&self, body: &str) {
        if let Ok(mut csrf) = self.csrf.lock() {
            let settings = CsrfSettings::from_page(body, csrf.settings());
            csrf.set_settings(settings);
        }
        if let Ok(mut page) = self.last_page.lock() {
            *page = Some(body.to_string());
        }
    }

    pub fn schema_page_url(&self, connection: &str) -> Result<Url> {
        self.url(&format!("schema/{}", Self::segment(connection)))
    }

    pub fn format_sql(&self, sql: &str) -> Result<String> {
        let request = self.client.post(self.url("format/")?).form(&[("sql", sql)]);
        let response = Self::check(self.with_csrf(request).send()?)?;
        let formatted: FormatResponse = response.json().context("Unexpected format response")?;
        Ok(formatted.formatted)
    }

    /// Uploads a csv/json/sqlite file as a new connection, reporting
    /// `(sent, total)` while the body streams.
    pub fn upload_file<F>(&self, path: &Path, on_progress: F) -> Result<UploadResponse>
    where
        F: FnMut(u64, u64) + Send + 'static,
    {
        let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
        let total = file.metadata()?.len();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("Upload path has no file name"))?
            .to_string();

        let reader = ProgressReader::new(file, total, on_progress);
        let part = multipart::Part::reader_with_length(reader, total).file_name(file_name);
        let form = multipart::Form::new().part("file", part);

        info!(target: "api", "Uploading {} ({} bytes)", path.display(), total);
        let request = self
            .client
            .post(self.url("connections/upload/")?)
            .multipart(form);
        let response = Self::check(self.with_csrf(request).send()?)?;
        let body = response.text()?;
        // A redirect to the connections page also means success
        Ok(serde_json::from_str(&body).unwrap_or(UploadResponse {
            success: true,
            error: None,
        }))
    }

    pub fn validate_connection(&self, fields: &[(String, String)]) -> Result<ValidationResult> {
        let request = self
            .client
            .post(self.url("connections/validate/")?)
            .form(fields);
        let response = Self::check(self.with_csrf(request).send()?)?;
        response.json().context("Unexpected validation response")
    }

    pub fn email_csv(&self, query_id: &str, email: &str) -> Result<EmailResponse> {
        let url = self.url(&format!("{}/email_csv", Self::segment(query_id)))?;
        let request = self
            .client
            .post(url)
            .header("X-Requested-With", "XMLHttpRequest")
            .form(&[("email", email)]);
        let response = Self::check(self.with_csrf(request).send()?)?;
        response.json().context("Unexpected email response")
    }

    /// Toggles a favorite through the URL the list page gave for it.
    pub fn toggle_favorite(&self, favorite_url: &str) -> Result<FavoriteResponse> {
        let url = self.url(favorite_url)?;
        let request = self.client.post(url).json(&json!({}));
        let response = Self::check(self.with_csrf(request).send()?)?;
        response.json().context("Unexpected favorite response")
    }

    /// HTML of the saved-query index page.
    pub fn query_list_page(&self) -> Result<String> {
        self.get_page("")
    }

    pub fn ask_assistant(&self, request: &AssistantRequest) -> Result<AssistantResponse> {
        let http = self.client.post(self.url("assistant/")?).json(request);
        let response = Self::check(self.with_csrf(http).send()?)?;
        response.json().context("Unexpected assistant response")
    }

    pub fn assistant_history(&self, connection_id: Option<&str>) -> Result<Vec<HistoryLog>> {
        let http = self
            .client
            .post(self.url("assistant/history/")?)
            .json(&json!({ "connection_id": connection_id }));
        let response = Self::check(self.with_csrf(http).send()?)?;
        let history: HistoryResponse = response.json().context("Unexpected history response")?;
        Ok(history.logs)
    }

    /// Results of a saved query, via the CSV download endpoint.
    pub fn query_results(&self, query_id: &str) -> Result<RenderedTable> {
        let mut url = self.url(&format!("{}/download", Self::segment(query_id)))?;
        url.query_pairs_mut().append_pair("format", "csv");
        let body = Self::check(self.client.get(url).send()?)?.text()?;
        RenderedTable::from_csv(&body)
    }
}

impl SchemaSource for ExplorerClient {
    fn fetch_schema(&self, connection: &str) -> Result<Schema> {
        let url = self.url(&format!("schema.json/{}", Self::segment(connection)))?;
        debug!(target: "api", "GET {}", url);
        let body = Self::check(self.client.get(url).send()?)?.text()?;
        Schema::from_json(&body)
    }
}

impl FormSubmitter for ExplorerClient {
    fn submit_form(&self, path: &str, fields: &[(String, String)]) -> Result<String> {
        self.submit_query(path, fields)
    }
}

impl AssistantBackend for ExplorerClient {
    fn ask(&self, request: &AssistantRequest) -> Result<AssistantResponse> {
        self.ask_assistant(request)
    }

    fn history(&self, connection_id: Option<&str>) -> Result<Vec<HistoryLog>> {
        self.assistant_history(connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::thread::{self, JoinHandle};

    /// Answers one request with `status` and `page`, handing back the
    /// request head and body it received.
    fn serve_once(
        status: &'static str,
        page: &'static str,
    ) -> (SocketAddr, JoinHandle<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut head = String::new();
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                head.push_str(&line);
            }
            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).unwrap();
            write!(
                stream,
                "HTTP/1.1 {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                page.len(),
                page
            )
            .unwrap();
            (head, String::from_utf8(body).unwrap())
        });
        (addr, handle)
    }

    fn local_client(addr: SocketAddr) -> ExplorerClient {
        ExplorerClient::new(
            &format!("http://{}/explorer", addr),
            CsrfSettings::default(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn client() -> ExplorerClient {
        ExplorerClient::new(
            "http://localhost:8000/explorer",
            CsrfSettings::default(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let client = client();
        assert_eq!(
            client.url("schema.json/main").unwrap().as_str(),
            "http://localhost:8000/explorer/schema.json/main"
        );
    }

    #[test]
    fn test_connection_is_one_segment() {
        let client = client();
        assert_eq!(
            client.schema_page_url("my db/x").unwrap().as_str(),
            "http://localhost:8000/explorer/schema/my%20db%2Fx"
        );
    }

    #[test]
    fn test_no_token_without_cookie() {
        assert_eq!(client().csrf_token(), None);
    }

    #[test]
    fn test_cookie_token_is_used() {
        let client = client();
        client
            .jar
            .add_cookie_str("csrftoken=abc123; Path=/", client.base_url());
        assert_eq!(client.csrf_token().as_deref(), Some("abc123"));
    }

    #[test]
    fn test_submit_query_posts_form_with_token() {
        let (addr, server) = serve_once("200 OK", "<p>saved</p>");
        let client = local_client(addr);
        client
            .jar
            .add_cookie_str("csrftoken=abc123; Path=/", client.base_url());

        let fields = vec![
            ("sql".to_string(), "select 1".to_string()),
            ("connection".to_string(), "main".to_string()),
        ];
        let page = client.submit_query("1/?show=0", &fields).unwrap();
        let (head, body) = server.join().unwrap();

        assert_eq!(page, "<p>saved</p>");
        assert!(head.starts_with("POST /explorer/1/?show=0 HTTP/1.1"));
        assert!(head.to_ascii_lowercase().contains("x-csrftoken: abc123"));
        assert_eq!(body, "sql=select+1&connection=main");
    }

    #[test]
    fn test_rejected_submission_is_an_error() {
        let (addr, server) = serve_once("500 Internal Server Error", "boom");
        let client = local_client(addr);
        let fields = vec![("sql".to_string(), "select 1".to_string())];

        let err = client.submit_query("play/", &fields).unwrap_err();
        server.join().unwrap();
        assert!(err.to_string().contains("500"));
    }
}
