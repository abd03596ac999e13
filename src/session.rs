use crate::cloud::{self, CloudApi, Device, HomeData, Product, UserData};
use crate::credentials::Credentials;
use tracing::{debug, info};

/// Product names under which the Zeo One washer shows up in the vendor cloud.
pub const TARGET_MODELS: [&str; 2] = ["H1", "H1 Neo"];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not log into the vendor cloud")]
    Login(#[source] cloud::Error),
    #[error("could not fetch the home device directory")]
    HomeData(#[source] cloud::Error),
    #[error("no `H1` or `H1 Neo` device in home `{0}`")]
    DeviceNotFound(String),
    #[error("no `H1` or `H1 Neo` product in home `{0}`")]
    ProductNotFound(String),
}

/// Everything needed to address status requests to one physical washer.
#[derive(Clone, Debug)]
pub struct DeviceHandle {
    pub user: UserData,
    pub device: Device,
    pub product: Product,
}

impl DeviceHandle {
    pub fn duid(&self) -> &str {
        &self.device.duid
    }

    pub fn category(&self) -> &str {
        &self.product.category
    }

    pub fn model(&self) -> &str {
        &self.product.model
    }
}

fn is_target(name: &str) -> bool {
    TARGET_MODELS.contains(&name)
}

/// Picks the washer and its product metadata out of the home directory.
///
/// The first matching entry in list order wins for both devices and products.
pub fn resolve_device(home: &HomeData) -> Result<(&Device, &Product), Error> {
    let device = home
        .devices
        .iter()
        .find(|d| is_target(&d.name))
        .ok_or_else(|| Error::DeviceNotFound(home.name.clone()))?;
    let product = home
        .products
        .iter()
        .find(|p| is_target(&p.name))
        .ok_or_else(|| Error::ProductNotFound(home.name.clone()))?;
    Ok((device, product))
}

/// Log in and locate the washer. Any failure here is fatal for the setup attempt.
pub async fn establish(
    api: &(impl CloudApi + ?Sized),
    credentials: &Credentials,
) -> Result<DeviceHandle, Error> {
    let user = api.login(credentials.password()).await.map_err(Error::Login)?;
    let home = api.home_data(&user).await.map_err(Error::HomeData)?;
    debug!(
        message = "searching home directory",
        home = %home.name,
        devices = ?home.devices.iter().map(|d| &d.name).collect::<Vec<_>>()
    );
    let (device, product) = resolve_device(&home)?;
    info!(
        message = "resolved washer",
        duid = %device.duid,
        name = %device.name,
        model = %product.model,
        category = %product.category,
        online = device.online
    );
    Ok(DeviceHandle { device: device.clone(), product: product.clone(), user })
}
