use std::error::Error;
use std::fs;
use std::io::Write;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::cli::Cli;

/// A started job as reported by the server
#[derive(Debug, Deserialize)]
pub struct StartedJob {
    pub id: String,
    pub owner: String,
    pub started_at: String,
}

/// Status snapshot as reported by the server
#[derive(Debug, Deserialize)]
pub struct JobStatus {
    pub status: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for the overseer server API, authenticated with the user's
/// certificate unless running against an --insecure-http server
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(cli: &Cli) -> Result<Self, Box<dyn Error>> {
        let mut builder = reqwest::Client::builder();

        if !cli.insecure_http {
            // reqwest wants the leaf certificate and key in one PEM bundle
            let identity_pem = [fs::read(&cli.cert)?, fs::read(&cli.key)?].concat();
            let identity = reqwest::Identity::from_pem(&identity_pem)?;
            let ca = reqwest::Certificate::from_pem(&fs::read(&cli.ca)?)?;
            builder = builder
                .use_rustls_tls()
                .identity(identity)
                .add_root_certificate(ca);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: cli.server.trim_end_matches('/').to_string(),
        })
    }

    pub async fn start(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<StartedJob, Box<dyn Error>> {
        let url = format!("{}/api/v1/jobs", self.base_url);
        debug!("POST {url}");

        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({ "command": command, "arguments": args }))
            .send()
            .await?;

        Self::parse(resp).await
    }

    pub async fn stop(&self, id: &str) -> Result<(), Box<dyn Error>> {
        let url = format!("{}/api/v1/jobs/{id}/stop", self.base_url);
        debug!("POST {url}");

        let resp = self.http.post(url).send().await?;
        Self::check(resp).await?;

        Ok(())
    }

    pub async fn status(&self, id: &str) -> Result<JobStatus, Box<dyn Error>> {
        let url = format!("{}/api/v1/jobs/{id}/status", self.base_url);
        debug!("GET {url}");

        let resp = self.http.get(url).send().await?;
        Self::parse(resp).await
    }

    /// Stream one of the job's output channels into `out`, from the first
    /// captured byte until the job's buffer closes
    pub async fn stream_logs(
        &self,
        id: &str,
        stderr: bool,
        out: &mut impl Write,
    ) -> Result<(), Box<dyn Error>> {
        let channel = if stderr { "stderr" } else { "stdout" };
        let url = format!("{}/api/v1/jobs/{id}/{channel}", self.base_url);
        debug!("GET {url}");

        let mut resp = Self::check(self.http.get(url).send().await?).await?;
        while let Some(chunk) = resp.chunk().await? {
            out.write_all(&chunk)?;
            out.flush()?;
        }

        Ok(())
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, Box<dyn Error>> {
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let message = match resp.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };

        Err(format!("server rejected request ({status}): {message}").into())
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Box<dyn Error>> {
        let resp = Self::check(resp).await?;
        Ok(resp.json::<T>().await?)
    }
}
