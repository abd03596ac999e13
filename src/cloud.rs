//! Vendor cloud REST API.
//!
//! Only the two calls needed to find the washer are implemented: password login and the
//! home/device directory. Everything else the vendor app does with the API is out of scope.

use base64::Engine as _;
use futures::future::BoxFuture;
use hmac::Mac as _;
use md5::Digest as _;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::credentials::Credentials;

const DISCOVERY_URL: &str = "https://euiot.roborock.com";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not construct the HTTP client")]
    CreateReqwest(#[source] reqwest::Error),
    #[error("request to `{1}` failed")]
    Request(#[source] reqwest::Error, &'static str),
    #[error("response from `{1}` is not valid JSON")]
    JsonDecode(#[source] reqwest::Error, &'static str),
    #[error("login was rejected: {0}")]
    Authentication(String),
    #[error("`{endpoint}` was rejected with code {code}: {message}")]
    Rejected { endpoint: &'static str, code: i64, message: String },
    #[error("`{0}` responded without any data")]
    MissingData(&'static str),
    #[error("could not sign the request to `{0}`")]
    Sign(&'static str),
}

/// The account descriptor returned by a successful login.
#[derive(serde::Deserialize, Clone, Debug)]
pub struct UserData {
    #[serde(default)]
    pub uid: Option<i64>,
    pub token: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    pub rriot: Rriot,
}

/// IoT credentials and endpoints handed out alongside the user token.
#[derive(serde::Deserialize, Clone, Debug)]
pub struct Rriot {
    pub u: String,
    pub s: String,
    pub h: String,
    pub k: String,
    pub r: RriotReference,
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct RriotReference {
    #[serde(default)]
    pub r: String,
    /// REST API host.
    pub a: String,
    /// MQTT broker, e.g. `ssl://mqtt-eu-3.roborock.com:8883`.
    pub m: String,
    #[serde(default)]
    pub l: String,
}

/// The device directory of the account's home.
#[derive(serde::Deserialize, Clone, Debug, Default)]
pub struct HomeData {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(serde::Deserialize, Clone, Debug, Default)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub category: String,
}

#[derive(serde::Deserialize, Clone, Debug, Default)]
pub struct Device {
    pub duid: String,
    pub name: String,
    #[serde(rename = "localKey")]
    pub local_key: String,
    #[serde(rename = "productId", default)]
    pub product_id: String,
    #[serde(default)]
    pub pv: Option<String>,
    #[serde(default)]
    pub online: bool,
}

/// The two cloud calls session establishment depends on.
pub trait CloudApi: Send + Sync {
    fn login<'a>(&'a self, password: &'a SecretString) -> BoxFuture<'a, Result<UserData, Error>>;
    fn home_data<'a>(&'a self, user: &'a UserData) -> BoxFuture<'a, Result<HomeData, Error>>;
}

#[derive(serde::Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

#[derive(serde::Deserialize)]
struct V2Envelope<T> {
    success: bool,
    #[serde(default)]
    msg: Option<String>,
    result: Option<T>,
}

#[derive(serde::Deserialize)]
struct UrlByEmail {
    url: String,
}

#[derive(serde::Deserialize)]
struct HomeDetail {
    #[serde(rename = "rrHomeId")]
    rr_home_id: i64,
}

pub struct CloudClient {
    http: reqwest::Client,
    email: String,
    discovery_url: String,
    base_url: OnceLock<String>,
    device_identifier: String,
}

impl CloudClient {
    pub fn new(credentials: &Credentials) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(Error::CreateReqwest)?;
        Ok(Self::with_client(
            http,
            credentials.email().to_string(),
            credentials.api_base_url(),
            DISCOVERY_URL.to_string(),
        ))
    }

    pub fn with_client(
        http: reqwest::Client,
        email: String,
        base_url: Option<String>,
        discovery_url: String,
    ) -> Self {
        let base = OnceLock::new();
        if let Some(url) = base_url {
            let _ = base.set(url);
        }
        let device_identifier = rand::thread_rng()
            .r#gen::<[u8; 16]>()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Self { http, email, discovery_url, base_url: base, device_identifier }
    }

    async fn base_url(&self) -> Result<&str, Error> {
        if let Some(url) = self.base_url.get() {
            return Ok(url.as_str());
        }
        const ENDPOINT: &str = "/api/v1/getUrlByEmail";
        let url = format!("{}{ENDPOINT}", self.discovery_url);
        debug!(message = "discovering the regional API host", url);
        let response = self
            .http
            .post(url)
            .query(&[("email", self.email.as_str()), ("needtwostepauth", "false")])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Request(e, ENDPOINT))?;
        let envelope = response
            .json::<Envelope<UrlByEmail>>()
            .await
            .map_err(|e| Error::JsonDecode(e, ENDPOINT))?;
        let data = checked(envelope, ENDPOINT)?;
        info!(message = "discovered regional API host", url = %data.url);
        Ok(self.base_url.get_or_init(|| data.url).as_str())
    }

    fn header_client_id(&self) -> String {
        let mut hasher = md5::Md5::new();
        hasher.update(self.email.as_bytes());
        hasher.update(self.device_identifier.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
    }

    async fn pass_login(&self, password: &SecretString) -> Result<UserData, Error> {
        const ENDPOINT: &str = "/api/v1/login";
        let url = format!("{}{ENDPOINT}", self.base_url().await?);
        debug!(message = "logging in", url);
        let response = self
            .http
            .post(url)
            .header("header_clientid", self.header_client_id())
            .query(&[
                ("username", self.email.as_str()),
                ("password", password.expose_secret()),
                ("needtwostepauth", "false"),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Request(e, ENDPOINT))?;
        let envelope = response
            .json::<Envelope<UserData>>()
            .await
            .map_err(|e| Error::JsonDecode(e, ENDPOINT))?;
        if envelope.code != 200 {
            return Err(Error::Authentication(
                envelope.msg.unwrap_or_else(|| format!("code {}", envelope.code)),
            ));
        }
        let user = envelope.data.ok_or(Error::MissingData(ENDPOINT))?;
        debug!(message = "login successful", uid = ?user.uid, region = ?user.region);
        Ok(user)
    }

    async fn home_id(&self, user: &UserData) -> Result<i64, Error> {
        const ENDPOINT: &str = "/api/v1/getHomeDetail";
        let url = format!("{}{ENDPOINT}", self.base_url().await?);
        let response = self
            .http
            .get(url)
            .header("header_clientid", self.header_client_id())
            .header("Authorization", &user.token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Request(e, ENDPOINT))?;
        let envelope = response
            .json::<Envelope<HomeDetail>>()
            .await
            .map_err(|e| Error::JsonDecode(e, ENDPOINT))?;
        Ok(checked(envelope, ENDPOINT)?.rr_home_id)
    }

    async fn home_data_v2(&self, user: &UserData) -> Result<HomeData, Error> {
        const ENDPOINT: &str = "/v2/user/homes";
        let home_id = self.home_id(user).await?;
        let path = format!("{ENDPOINT}/{home_id}");
        let authorization = hawk_authorization(
            &user.rriot,
            &path,
            jiff::Timestamp::now().as_second(),
            &random_nonce(),
        )?;
        let url = format!("{}{path}", user.rriot.r.a.trim_end_matches('/'));
        debug!(message = "fetching home data", url);
        let response = self
            .http
            .get(url)
            .header("Authorization", authorization)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Request(e, ENDPOINT))?;
        let envelope = response
            .json::<V2Envelope<HomeData>>()
            .await
            .map_err(|e| Error::JsonDecode(e, ENDPOINT))?;
        if !envelope.success {
            return Err(Error::Rejected {
                endpoint: ENDPOINT,
                code: 0,
                message: envelope.msg.unwrap_or_default(),
            });
        }
        let home = envelope.result.ok_or(Error::MissingData(ENDPOINT))?;
        debug!(
            message = "fetched home data",
            home = %home.name,
            devices = home.devices.len(),
            products = home.products.len()
        );
        Ok(home)
    }
}

impl CloudApi for CloudClient {
    fn login<'a>(&'a self, password: &'a SecretString) -> BoxFuture<'a, Result<UserData, Error>> {
        Box::pin(self.pass_login(password))
    }

    fn home_data<'a>(&'a self, user: &'a UserData) -> BoxFuture<'a, Result<HomeData, Error>> {
        Box::pin(self.home_data_v2(user))
    }
}

fn checked<T>(envelope: Envelope<T>, endpoint: &'static str) -> Result<T, Error> {
    if envelope.code != 200 {
        return Err(Error::Rejected {
            endpoint,
            code: envelope.code,
            message: envelope.msg.unwrap_or_default(),
        });
    }
    envelope.data.ok_or(Error::MissingData(endpoint))
}

fn random_nonce() -> String {
    let bytes = rand::thread_rng().r#gen::<[u8; 6]>();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Hawk-style `Authorization` header value for the v2 API.
pub(crate) fn hawk_authorization(
    rriot: &Rriot,
    path: &str,
    timestamp: i64,
    nonce: &str,
) -> Result<String, Error> {
    let path_digest = format!("{:x}", md5::Md5::digest(path.as_bytes()));
    let prestr = [rriot.u.as_str(), &rriot.s, nonce, &timestamp.to_string(), &path_digest, "", ""]
        .join(":");
    let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(rriot.h.as_bytes())
        .map_err(|_| Error::Sign("/v2/user/homes"))?;
    mac.update(prestr.as_bytes());
    let mac = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!(
        r#"Hawk id="{}", s="{}", ts="{timestamp}", nonce="{nonce}", mac="{mac}""#,
        rriot.u, rriot.s
    ))
}
