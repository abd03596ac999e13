use secrecy::SecretString;

/// The account used to reach the vendor cloud.
///
/// Provided once at setup and never changed afterwards. No format validation is performed on
/// any of the fields; the cloud is the one to reject bad values.
#[derive(Clone)]
pub struct Credentials {
    email: String,
    country_code: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(email: String, country_code: String, password: SecretString) -> Self {
        Self { email, country_code, password }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn country_code(&self) -> &str {
        &self.country_code
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    /// The regional API host for the configured country code.
    ///
    /// `None` if no country code was given, in which case the host is looked up by email.
    pub fn api_base_url(&self) -> Option<String> {
        let country = self.country_code.trim();
        if country.is_empty() {
            return None;
        }
        Some(format!("https://{}iot.roborock.com", country.to_lowercase()))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("country_code", &self.country_code)
            .finish_non_exhaustive()
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "credentials::Args")]
pub struct Args {
    /// Email address of the vendor cloud account the washer is registered to.
    #[arg(long, env = "ZEO_ONE_EMAIL")]
    email: String,

    /// Region prefix of the vendor API host (e.g. `eu`, `us`, `cn`, `ru`).
    ///
    /// When left empty the region is discovered from the account email.
    #[arg(long, env = "ZEO_ONE_COUNTRY_CODE", default_value = "")]
    country_code: String,

    /// Password of the vendor cloud account.
    #[arg(long, env = "ZEO_ONE_PASSWORD", hide_env_values = true)]
    password: String,
}

impl Args {
    pub fn into_credentials(self) -> Credentials {
        Credentials::new(self.email, self.country_code, SecretString::from(self.password))
    }
}
