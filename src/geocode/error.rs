use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geocoder returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("no address found for {latitude}, {longitude}")]
    NotFound { latitude: f64, longitude: f64 },
    #[error("geocoder error: {0}")]
    Other(String),
}
