use std::ops::Deref;

use reqwest::{Client, ClientBuilder};

use crate::HozonResult;

/// Shared HTTP client used by every fetch of the engine.
///
/// Cloning is cheap, all clones share the same connection pool.
#[derive(Clone, Default)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> HozonResult<Self> {
        let client = builder.build()?;
        Ok(Self { client })
    }

    pub fn with_user_agent(user_agent: &str) -> HozonResult<Self> {
        Self::new(Client::builder().user_agent(user_agent))
    }
}

impl From<Client> for HttpClient {
    fn from(client: Client) -> Self {
        Self { client }
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
