//! The external occurrence-data service boundary. Modeled after the SQL
//! download endpoint's submit/poll/fetch lifecycle: a batch of taxon keys is
//! submitted as one SQL download request, polled until it leaves the queue,
//! then the resulting TSV is fetched.

use std::io::Read;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::errors::RemoteError;
use crate::retry::{retry, DEFAULT_ATTEMPTS, DEFAULT_BACKOFF};

/// Batch size cap the real service enforces on a single SQL download request.
pub const QUERY_BATCH_LIMIT: usize = 101_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Submitted,
    Polling,
    Succeeded,
    Killed,
}

pub trait OccurrenceClient: Send + Sync {
    /// Submits a SQL download request for `taxon_keys`, returning a
    /// service-assigned request id.
    fn submit(&self, taxon_keys: &[i64]) -> Result<String, RemoteError>;

    /// Polls the status of a previously submitted request.
    fn poll(&self, request_id: &str) -> Result<DownloadStatus, RemoteError>;

    /// Fetches the completed download's raw TSV bytes.
    fn fetch(&self, request_id: &str) -> Result<Vec<u8>, RemoteError>;
}

/// Drives one request through submit -> poll-until-terminal -> fetch,
/// sleeping `poll_interval` between polls. A `KILLED` terminal state is
/// reported as [`RemoteError::DownloadKilled`]. Transport errors during poll
/// or fetch are retried with the standard retry/backoff policy rather than
/// aborting the whole batch.
pub fn download_batch(
    client: &dyn OccurrenceClient,
    taxon_keys: &[i64],
    poll_interval: Duration,
    sleep: impl Fn(Duration),
) -> Result<Vec<u8>, RemoteError> {
    let request_id = client.submit(taxon_keys)?;
    loop {
        match retry(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || client.poll(&request_id))? {
            DownloadStatus::Succeeded => return retry(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || client.fetch(&request_id)),
            DownloadStatus::Killed => return Err(RemoteError::DownloadKilled),
            DownloadStatus::Submitted | DownloadStatus::Polling => sleep(poll_interval),
        }
    }
}

const DOWNLOAD_ENDPOINT: &str = "https://api.gbif.org/v1/occurrence/download/request";
const STATUS_ENDPOINT: &str = "https://api.gbif.org/v1/occurrence/download";

/// Real occurrence client, backed by the SQL download endpoint. Credentials
/// are read once at construction (`GBIF_USER`/`GBIF_PWD`), never threaded
/// through call sites as plain arguments.
pub struct GbifOccurrenceClient {
    agent: ureq::Agent,
    user: String,
    password: String,
    base_url: String,
    status_url: String,
}

#[derive(Debug, Deserialize)]
struct DownloadMeta {
    status: String,
}

impl GbifOccurrenceClient {
    pub fn new(user: String, password: String) -> Self {
        Self {
            agent: ureq::agent(),
            user,
            password,
            base_url: DOWNLOAD_ENDPOINT.to_string(),
            status_url: STATUS_ENDPOINT.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_urls(user: String, password: String, base_url: String, status_url: String) -> Self {
        Self { agent: ureq::agent(), user, password, base_url, status_url }
    }

    fn sql_for(&self, taxon_keys: &[i64]) -> String {
        let keys = taxon_keys.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
        format!(
            "SELECT acceptedtaxonkey, decimallatitude, decimallongitude, countrycode FROM occurrence \
             WHERE acceptedtaxonkey IN ({keys}) AND hascoordinate = TRUE;"
        )
    }
}

impl OccurrenceClient for GbifOccurrenceClient {
    fn submit(&self, taxon_keys: &[i64]) -> Result<String, RemoteError> {
        let payload = json!({
            "sendNotification": false,
            "notificationAddresses": ["none@provided.com"],
            "format": "SQL_TSV_ZIP",
            "sql": self.sql_for(taxon_keys),
        });

        let mut response = self
            .agent
            .post(&self.base_url)
            .header("Content-Type", "application/json")
            .auth(&self.user, &self.password)
            .send_json(&payload)
            .map_err(|err| RemoteError::Transport(err.to_string()))?;

        let body = response.body_mut().read_to_string().map_err(|err| RemoteError::Transport(err.to_string()))?;
        body.lines().last().map(str::to_string).ok_or_else(|| RemoteError::Rejected("empty download response".into()))
    }

    fn poll(&self, request_id: &str) -> Result<DownloadStatus, RemoteError> {
        let url = format!("{}/{request_id}", self.status_url);
        let mut response =
            self.agent.get(&url).call().map_err(|err| RemoteError::Transport(err.to_string()))?;
        let meta: DownloadMeta =
            response.body_mut().read_json().map_err(|err| RemoteError::Transport(err.to_string()))?;

        Ok(match meta.status.as_str() {
            "SUCCEEDED" => DownloadStatus::Succeeded,
            "KILLED" => DownloadStatus::Killed,
            "RUNNING" | "PREPARING" => DownloadStatus::Polling,
            _ => DownloadStatus::Submitted,
        })
    }

    fn fetch(&self, request_id: &str) -> Result<Vec<u8>, RemoteError> {
        let url = format!("{}/request/{request_id}.zip", self.status_url);
        let mut response = self.agent.get(&url).call().map_err(|err| RemoteError::Transport(err.to_string()))?;

        let mut zip_bytes = Vec::new();
        response
            .body_mut()
            .as_reader()
            .read_to_end(&mut zip_bytes)
            .map_err(|err| RemoteError::Transport(err.to_string()))?;

        let cursor = std::io::Cursor::new(zip_bytes);
        let mut archive =
            zip::ZipArchive::new(cursor).map_err(|err| RemoteError::Transport(format!("bad download archive: {err}")))?;
        let mut file = archive
            .by_index(0)
            .map_err(|err| RemoteError::Transport(format!("empty download archive: {err}")))?;

        let mut tsv_bytes = Vec::new();
        file.read_to_end(&mut tsv_bytes).map_err(|err| RemoteError::Transport(err.to_string()))?;
        Ok(tsv_bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct ScriptedClient {
        polls_remaining: RefCell<u32>,
        final_status: DownloadStatus,
    }

    impl OccurrenceClient for ScriptedClient {
        fn submit(&self, _taxon_keys: &[i64]) -> Result<String, RemoteError> {
            Ok("req-1".to_string())
        }

        fn poll(&self, _request_id: &str) -> Result<DownloadStatus, RemoteError> {
            let mut remaining = self.polls_remaining.borrow_mut();
            if *remaining == 0 {
                Ok(self.final_status)
            }
            else {
                *remaining -= 1;
                Ok(DownloadStatus::Polling)
            }
        }

        fn fetch(&self, _request_id: &str) -> Result<Vec<u8>, RemoteError> {
            Ok(b"acceptedtaxonkey\tdecimallatitude\tdecimallongitude\tcountrycode\n".to_vec())
        }
    }

    #[test]
    fn polls_until_succeeded_then_fetches() {
        let client = ScriptedClient { polls_remaining: RefCell::new(2), final_status: DownloadStatus::Succeeded };
        let bytes = download_batch(&client, &[1, 2, 3], Duration::from_millis(0), |_| {}).unwrap();
        assert!(bytes.starts_with(b"acceptedtaxonkey"));
    }

    struct FlakyThenSucceedsClient {
        poll_failures_remaining: RefCell<u32>,
        fetch_failures_remaining: RefCell<u32>,
    }

    impl OccurrenceClient for FlakyThenSucceedsClient {
        fn submit(&self, _taxon_keys: &[i64]) -> Result<String, RemoteError> {
            Ok("req-1".to_string())
        }

        fn poll(&self, _request_id: &str) -> Result<DownloadStatus, RemoteError> {
            let mut remaining = self.poll_failures_remaining.borrow_mut();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Transport("transient poll failure".to_string()));
            }
            Ok(DownloadStatus::Succeeded)
        }

        fn fetch(&self, _request_id: &str) -> Result<Vec<u8>, RemoteError> {
            let mut remaining = self.fetch_failures_remaining.borrow_mut();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Transport("transient fetch failure".to_string()));
            }
            Ok(b"acceptedtaxonkey\tdecimallatitude\tdecimallongitude\tcountrycode\n".to_vec())
        }
    }

    #[test]
    fn transient_poll_and_fetch_transport_errors_are_retried() {
        let client =
            FlakyThenSucceedsClient { poll_failures_remaining: RefCell::new(2), fetch_failures_remaining: RefCell::new(2) };
        let bytes = download_batch(&client, &[1], Duration::from_millis(0), |_| {}).unwrap();
        assert!(bytes.starts_with(b"acceptedtaxonkey"));
    }

    #[test]
    fn killed_status_is_an_error() {
        let client = ScriptedClient { polls_remaining: RefCell::new(0), final_status: DownloadStatus::Killed };
        let result = download_batch(&client, &[1], Duration::from_millis(0), |_| {});
        assert!(matches!(result, Err(RemoteError::DownloadKilled)));
    }

    #[test]
    fn gbif_client_submits_polls_and_unzips_fetch() {
        let mut server = mockito::Server::new();

        let _submit = server
            .mock("POST", "/request")
            .with_status(201)
            .with_body("0123456789\n0123456789-abcd")
            .create();
        let _status = server
            .mock("GET", "/0123456789-abcd")
            .with_status(200)
            .with_body(r#"{"status":"SUCCEEDED"}"#)
            .create();

        let mut zip_bytes = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            writer.start_file::<_, ()>("occurrence.tsv", Default::default()).unwrap();
            std::io::Write::write_all(&mut writer, b"acceptedtaxonkey\tdecimallatitude\tdecimallongitude\tcountrycode\n1\t50.0\t10.0\tDE\n").unwrap();
            writer.finish().unwrap();
        }
        let _fetch = server
            .mock("GET", "/request/0123456789-abcd.zip")
            .with_status(200)
            .with_body(zip_bytes)
            .create();

        let client = GbifOccurrenceClient::with_base_urls(
            "user".into(),
            "pwd".into(),
            format!("{}/request", server.url()),
            server.url(),
        );

        let request_id = client.submit(&[1, 2]).unwrap();
        assert_eq!(request_id, "0123456789-abcd");
        assert_eq!(client.poll(&request_id).unwrap(), DownloadStatus::Succeeded);

        let tsv = client.fetch(&request_id).unwrap();
        assert!(tsv.starts_with(b"acceptedtaxonkey"));
    }
}
