use reqwest::{Client, StatusCode};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::room::{NewRoom, Room, RoomPatch};

/// Room lifecycle CRUD, as the controller consumes it. The trait seam
/// exists so the synchronization core can be exercised against an
/// in-memory backend in tests.
pub trait RoomApi {
    fn room_by_id(&self, id: Uuid) -> impl Future<Output = Result<Room>>;
    fn create_room(&self, room: NewRoom) -> impl Future<Output = Result<Room>>;
    fn join_room(&self, id: Uuid) -> impl Future<Output = Result<Room>>;
    fn update_room(&self, id: Uuid, patch: RoomPatch) -> impl Future<Output = Result<Room>>;
    fn search_rooms(&self, query: &str) -> impl Future<Output = Result<Vec<Room>>>;
    fn list_rooms(&self, public_only: bool) -> impl Future<Output = Result<Vec<Room>>>;
}

/// REST client for the external room backend.
#[derive(Debug, Clone)]
pub struct HttpRoomApi {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpRoomApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|err| SyncError::Connection(err.to_string()))?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn decode_room(response: reqwest::Response) -> Result<Room> {
        match response.status() {
            StatusCode::NOT_FOUND => Err(SyncError::Fetch("room not found".to_string())),
            status if status.is_success() => Ok(response.json().await?),
            status => Err(SyncError::Fetch(format!("backend returned {status}"))),
        }
    }
}

impl RoomApi for HttpRoomApi {
    async fn room_by_id(&self, id: Uuid) -> Result<Room> {
        let response = self
            .client
            .get(self.url(&format!("/rooms/{id}")))
            .header("Authorization", self.bearer())
            .send()
            .await?;
        Self::decode_room(response).await
    }

    async fn create_room(&self, room: NewRoom) -> Result<Room> {
        let response = self
            .client
            .post(self.url("/rooms"))
            .header("Authorization", self.bearer())
            .json(&room)
            .send()
            .await?;
        Self::decode_room(response).await
    }

    async fn join_room(&self, id: Uuid) -> Result<Room> {
        let response = self
            .client
            .post(self.url(&format!("/rooms/{id}/join")))
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|err| SyncError::Join(err.to_string()))?;
        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|err| SyncError::Join(err.to_string())),
            status => Err(SyncError::Join(format!("backend returned {status}"))),
        }
    }

    async fn update_room(&self, id: Uuid, patch: RoomPatch) -> Result<Room> {
        let response = self
            .client
            .patch(self.url(&format!("/rooms/{id}")))
            .header("Authorization", self.bearer())
            .json(&patch)
            .send()
            .await?;
        Self::decode_room(response).await
    }

    async fn search_rooms(&self, query: &str) -> Result<Vec<Room>> {
        let response = self
            .client
            .get(self.url("/rooms/search"))
            .query(&[("q", query)])
            .header("Authorization", self.bearer())
            .send()
            .await?;
        Ok(response.error_for_status()?.json().await?)
    }

    async fn list_rooms(&self, public_only: bool) -> Result<Vec<Room>> {
        let response = self
            .client
            .get(self.url("/rooms"))
            .query(&[("public", public_only)])
            .header("Authorization", self.bearer())
            .send()
            .await?;
        Ok(response.error_for_status()?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let api = HttpRoomApi::new("http://localhost:8080///", "t").unwrap();
        assert_eq!(api.url("/rooms"), "http://localhost:8080/rooms");
    }
}
