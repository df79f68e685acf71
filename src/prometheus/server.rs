//! HTTP server for the metrics and probe endpoints.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, error, info, warn};
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Registry, TextEncoder, TEXT_FORMAT};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use super::snapshot::ScrapeSnapshot;
use super::{update_process_metrics, REGISTRY};
use crate::collector::{CollectorRegistry, MetricSink, PostgresCollector};
use crate::config::ConfigRepository;
use crate::errors::Error;
use crate::exporter::{Exporter, ExporterOptions};
use crate::server::ServerCache;

const MAX_REQUEST_HEAD: usize = 8192;
const PROBE_PATH: &str = "/probe";

/// Everything a request handler needs. Built once at startup.
pub struct HttpContext {
    pub telemetry_path: String,
    pub registry: Arc<CollectorRegistry>,
    pub servers: Arc<ServerCache>,
    pub config: Arc<ConfigRepository>,
    /// Server-level scrape of the static targets.
    pub exporter: Arc<Exporter>,
    /// Leaf collectors of the static target, if there is one.
    pub collector: Option<PostgresCollector>,
}

#[derive(Debug, PartialEq)]
struct Request {
    method: String,
    path: String,
    params: Vec<(String, String)>,
    accepts_gzip: bool,
}

impl Request {
    fn parse(head: &str) -> Option<Request> {
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?;
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let params = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();

        let accepts_gzip = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .any(|(name, value)| {
                name.trim().eq_ignore_ascii_case("accept-encoding")
                    && value.to_ascii_lowercase().contains("gzip")
            });

        Some(Request {
            method,
            path: path.to_string(),
            params,
            accepts_gzip,
        })
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn params<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.params
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug)]
struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn text(status: u16, body: impl Into<String>) -> Response {
        Response {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            _ => "Internal Server Error",
        }
    }
}

impl HttpContext {
    async fn route(&self, request: &Request) -> Response {
        if request.method != "GET" && request.method != "HEAD" {
            return Response::text(405, "method not allowed\n");
        }
        if request.path == self.telemetry_path {
            self.metrics().await
        } else if request.path == PROBE_PATH {
            self.probe(request).await
        } else if request.path == "/" {
            self.landing_page()
        } else {
            Response::text(404, "not found\n")
        }
    }

    async fn metrics(&self) -> Response {
        let sink = Arc::new(MetricSink::new());
        if let Err(err) = self.exporter.scrape(&sink).await {
            error!("Error scraping server metrics: {err}");
        }
        let descs = match &self.collector {
            Some(collector) => {
                collector.collect(&sink).await;
                collector.describe().into_iter().cloned().collect()
            }
            None => Vec::new(),
        };

        update_process_metrics();
        match gather(descs, &sink) {
            Ok(mut families) => {
                families.extend(REGISTRY.gather());
                encode(&families)
            }
            Err(err) => {
                error!("Failed to gather metrics: {err}");
                Response::text(500, format!("failed to gather metrics: {err}\n"))
            }
        }
    }

    /// Scrapes one configured instance into a registry that lives only for
    /// this request.
    async fn probe(&self, request: &Request) -> Response {
        let Some(instance_id) = request.param("instance_id").filter(|id| !id.is_empty()) else {
            warn!("instance_id is required");
            return Response::text(400, "instance_id is required\n");
        };

        let config = self.config.get();
        let dsn = match config.resolve_by_identifier(instance_id) {
            Ok(dsn) => dsn,
            Err(err) => {
                error!("Failed to configure target: {err}");
                return Response::text(400, format!("could not configure dsn for target: {err}\n"));
            }
        };
        let filters: Vec<String> = request.params("collect[]").map(String::from).collect();
        let collector =
            match PostgresCollector::new(&self.registry, Arc::clone(&self.servers), &dsn, &filters)
            {
                Ok(collector) => collector,
                Err(err) => {
                    error!("Error creating probe collector: {err}");
                    return Response::text(500, format!("{err}\n"));
                }
            };

        let options = ExporterOptions {
            exclude_databases: config
                .find_instance(instance_id)
                .map(|instance| instance.excluded_databases())
                .unwrap_or_default(),
            ..self.exporter.options().clone()
        };
        let exporter = Exporter::new(vec![dsn], options, Arc::clone(&self.servers));

        let sink = Arc::new(MetricSink::new());
        if let Err(err) = exporter.scrape(&sink).await {
            error!("Error scraping server metrics of {instance_id}: {err}");
        }
        collector.collect(&sink).await;

        let descs = collector.describe().into_iter().cloned().collect();
        match gather(descs, &sink) {
            Ok(families) => encode(&families),
            Err(err) => {
                error!("Failed to gather probe metrics of {instance_id}: {err}");
                Response::text(500, format!("failed to gather metrics: {err}\n"))
            }
        }
    }

    fn landing_page(&self) -> Response {
        let body = format!(
            "<html>\n<head><title>pg_stats_exporter</title></head>\n<body>\n\
             <h1>pg_stats_exporter</h1>\n\
             <p>Version {}</p>\n\
             <p><a href=\"{}\">Metrics</a></p>\n\
             <p><a href=\"{PROBE_PATH}?instance_id=\">Probe</a> a configured instance</p>\n\
             </body>\n</html>\n",
            crate::VERSION,
            self.telemetry_path
        );
        Response {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: body.into_bytes(),
        }
    }
}

/// Passes a finished scrape through an isolated registry.
fn gather(descs: Vec<Desc>, sink: &MetricSink) -> Result<Vec<MetricFamily>, Error> {
    let registry = Registry::new();
    registry.register(Box::new(ScrapeSnapshot::new(descs, sink.gather())))?;
    Ok(registry.gather())
}

fn encode(families: &[MetricFamily]) -> Response {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(families, &mut buffer) {
        error!("Failed to encode metrics: {err}");
        return Response::text(500, format!("failed to encode metrics: {err}\n"));
    }
    Response {
        status: 200,
        content_type: TEXT_FORMAT,
        body: buffer,
    }
}

fn compress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|window| window == b"\r\n\r\n") || head.len() >= MAX_REQUEST_HEAD
        {
            break;
        }
    }
    Ok(head)
}

/// Handles one HTTP request.
pub async fn handle_request(context: Arc<HttpContext>, mut stream: TcpStream) {
    let head = match read_request_head(&mut stream).await {
        Ok(head) => head,
        Err(err) => {
            error!("Failed to read HTTP request: {err}");
            return;
        }
    };

    let parsed = std::str::from_utf8(&head).ok().and_then(Request::parse);
    let (response, accepts_gzip, is_head) = match parsed {
        Some(request) => {
            debug!("{} {}", request.method, request.path);
            (
                context.route(&request).await,
                request.accepts_gzip,
                request.method == "HEAD",
            )
        }
        None => (Response::text(400, "malformed request\n"), false, false),
    };

    let status = response.status;
    let reason = response.reason();
    let content_type = response.content_type;
    let (body, content_encoding) = if accepts_gzip && status == 200 {
        match compress(&response.body) {
            Ok(compressed) => (compressed, "Content-Encoding: gzip\r\n"),
            Err(err) => {
                error!("Failed to compress response: {err}");
                return;
            }
        }
    } else {
        (response.body, "")
    };

    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        content_type,
        content_encoding,
        body.len()
    );

    let mut connection = tokio::io::BufWriter::new(stream);
    if let Err(err) = connection.write_all(header.as_bytes()).await {
        error!("Failed to write HTTP response header: {err}");
        return;
    }
    if !is_head {
        if let Err(err) = connection.write_all(&body).await {
            error!("Failed to write HTTP response body: {err}");
            return;
        }
    }
    if let Err(err) = connection.flush().await {
        error!("Failed to flush connection: {err}");
    }
}

/// Binds `host` and serves requests until the task is dropped.
pub async fn start_prometheus_server(host: &str, context: Arc<HttpContext>) -> Result<(), Error> {
    info!("Starting metrics server on {host}");
    let addr: SocketAddr = host.parse().map_err(|err| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("failed to parse socket address '{host}': {err}"),
        )
    })?;
    let listen_socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    listen_socket.set_reuseaddr(true)?;
    listen_socket.set_reuseport(true)?;
    listen_socket.bind(addr)?;
    let listener = listen_socket.listen(1024)?;
    info!("Metrics server listening on {addr}");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    handle_request(context, stream).await;
                });
            }
            Err(err) => {
                error!("Failed to accept connection: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{register_builtin, CollectorConfig, CollectorRegistryBuilder};
    use crate::config::Config;
    use crate::server::testing::FakeConnector;

    const CONFIG: &str = "instances:\n  - instance_id: db-1\n    exclude_dbs: secret\n    host: h\n    port: \"5432\"\n    db: postgres\n    user: u\n";

    fn context(connector: &FakeConnector) -> HttpContext {
        let mut builder = CollectorRegistryBuilder::new();
        register_builtin(&mut builder);
        builder.set_enabled("wait_events", false);
        let registry = Arc::new(builder.build(CollectorConfig::default()));
        let servers = Arc::new(ServerCache::new(Arc::new(connector.clone())));
        let config = Arc::new(ConfigRepository::with_config(
            "unused.yml",
            Config::parse(CONFIG).unwrap(),
        ));
        let exporter = Arc::new(Exporter::new(
            vec!["host=static".to_string()],
            ExporterOptions::default(),
            Arc::clone(&servers),
        ));
        let collector =
            PostgresCollector::new(&registry, Arc::clone(&servers), "host=static", &[]).unwrap();
        HttpContext {
            telemetry_path: "/metrics".to_string(),
            registry,
            servers,
            config,
            exporter,
            collector: Some(collector),
        }
    }

    fn get(target: &str) -> Request {
        Request::parse(&format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n")).unwrap()
    }

    fn body(response: &Response) -> String {
        String::from_utf8(response.body.clone()).unwrap()
    }

    #[test]
    fn test_parse_request() {
        let request = Request::parse(
            "GET /probe?instance_id=db%2D1&collect[]=memory&collect[]=locks HTTP/1.1\r\n\
             Host: localhost\r\nACCEPT-ENCODING: deflate, GZIP\r\n\r\n",
        )
        .unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/probe");
        assert_eq!(request.param("instance_id"), Some("db-1"));
        assert_eq!(
            request.params("collect[]").collect::<Vec<_>>(),
            vec!["memory", "locks"]
        );
        assert!(request.accepts_gzip);

        assert!(!get("/metrics").accepts_gzip);
        assert!(Request::parse("").is_none());
        assert!(Request::parse("GET\r\n\r\n").is_none());
    }

    #[test]
    fn test_compress_round_trips_through_gzip() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let compressed = compress(b"gs_up 1\n").unwrap();
        let mut decoded = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "gs_up 1\n");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let connector = FakeConnector::new();
        let context = context(&connector);
        let response = context.route(&get("/metrics")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, TEXT_FORMAT);

        let text = body(&response);
        assert!(text.contains("gs_up 1"));
        assert!(text.contains("gs_scrape_collector_success{collector=\"memory\"}"));
        assert!(text.contains("gs_scrape_collector_duration_seconds{collector=\"locks\"}"));
    }

    #[tokio::test]
    async fn test_instance_scrape_requires_known_instance_id() {
        let connector = FakeConnector::new();
        let context = context(&connector);

        let missing = context.route(&get("/probe")).await;
        assert_eq!(missing.status, 400);
        assert_eq!(body(&missing), "instance_id is required\n");

        let empty = context.route(&get("/probe?instance_id=")).await;
        assert_eq!(empty.status, 400);

        let unknown = context.route(&get("/probe?instance_id=nope")).await;
        assert_eq!(unknown.status, 400);
        assert!(body(&unknown).contains("instance_id nope not found"));
    }

    #[tokio::test]
    async fn test_instance_scrape_with_disabled_collector_is_server_error() {
        let connector = FakeConnector::new();
        let context = context(&connector);
        let response = context
            .route(&get("/probe?instance_id=db-1&collect[]=wait_events"))
            .await;
        assert_eq!(response.status, 500);
        assert!(body(&response).contains("disabled collector: wait_events"));
    }

    #[tokio::test]
    async fn test_instance_scrape_uses_configured_instance() {
        let connector = FakeConnector::new();
        let context = context(&connector);
        let response = context
            .route(&get("/probe?instance_id=db-1&collect[]=memory"))
            .await;
        assert_eq!(response.status, 200);

        let text = body(&response);
        assert!(text.contains("gs_up 1"));
        assert!(text.contains("gs_scrape_collector_success{collector=\"memory\"} 0"));
        assert!(!text.contains("collector=\"locks\""));
        // the probe shares the cache of the long-lived server entries
        assert!(!context.servers.is_empty());
    }

    #[tokio::test]
    async fn test_landing_page_and_unknown_paths() {
        let connector = FakeConnector::new();
        let context = context(&connector);

        let landing = context.route(&get("/")).await;
        assert_eq!(landing.status, 200);
        assert!(body(&landing).contains("href=\"/metrics\""));

        assert_eq!(context.route(&get("/nope")).await.status, 404);

        let post = Request::parse("POST /metrics HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(context.route(&post).await.status, 405);
    }

    async fn exchange(context: Arc<HttpContext>, request: &str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_request(context, stream).await;
        });
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        server.await.unwrap();
        String::from_utf8_lossy(&raw).into_owned()
    }

    #[tokio::test]
    async fn test_handle_request_writes_status_line_and_headers() {
        let connector = FakeConnector::new();
        let context = Arc::new(context(&connector));

        let raw = exchange(
            Arc::clone(&context),
            "GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains(&format!("Content-Type: {TEXT_FORMAT}\r\n")));
        assert!(raw.contains("gs_up 1"));

        let raw = exchange(
            Arc::clone(&context),
            "GET /nope HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n",
        )
        .await;
        assert!(raw.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(!raw.contains("Content-Encoding"));

        let raw = exchange(context, "HEAD / HTTP/1.1\r\n\r\n").await;
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.ends_with("\r\n\r\n"));
    }
}
