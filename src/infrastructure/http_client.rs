use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Serialize;

static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
});

/// Basic-auth credentials for an upstream API
pub struct BasicAuth<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

pub async fn post_json<T: Serialize + ?Sized>(
    url: &str,
    payload: &T,
    auth: &BasicAuth<'_>,
) -> Result<reqwest::Response, reqwest::Error> {
    CLIENT
        .post(url)
        .basic_auth(auth.username, Some(auth.password))
        .json(payload)
        .send()
        .await
}

pub async fn get(url: &str, auth: &BasicAuth<'_>) -> Result<reqwest::Response, reqwest::Error> {
    CLIENT
        .get(url)
        .basic_auth(auth.username, Some(auth.password))
        .send()
        .await
}
