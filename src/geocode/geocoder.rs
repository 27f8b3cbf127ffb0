use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::error::GeocodeError;

pub const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";
const NOMINATIM_ZOOM: u8 = 18;

/// Address lookup collaborator. Calls may complete in any order.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse_geocode(&self, latitude: f64, longitude: f64)
        -> Result<String, GeocodeError>;
}

/// Labels a point with its own coordinates after an optional delay.
#[derive(Debug, Clone, Default)]
pub struct EchoGeocoder {
    pub latency: Duration,
}

impl EchoGeocoder {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl ReverseGeocoder for EchoGeocoder {
    async fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<String, GeocodeError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(format!("{:.5}, {:.5}", latitude, longitude))
    }
}

/// OpenStreetMap Nominatim reverse endpoint.
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct NominatimReverse {
    display_name: Option<String>,
    error: Option<String>,
}

impl NominatimGeocoder {
    pub fn new(base_url: &str, user_agent: &str) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn reverse_url(&self, latitude: f64, longitude: f64) -> String {
        format!(
            "{}/reverse?lat={}&lon={}&format=json&zoom={}",
            self.base_url, latitude, longitude, NOMINATIM_ZOOM
        )
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    async fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<String, GeocodeError> {
        let response = self
            .client
            .get(self.reverse_url(latitude, longitude))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GeocodeError::Status(response.status()));
        }

        let body: NominatimReverse = response.json().await?;
        match (body.display_name, body.error) {
            (Some(name), _) => Ok(name),
            (None, Some(message)) if message != "Unable to geocode" => {
                Err(GeocodeError::Other(message))
            }
            (None, _) => Err(GeocodeError::NotFound {
                latitude,
                longitude,
            }),
        }
    }
}
