//! Room membership bookkeeping on the relay site.
//!
//! The relay keeps a list of who is in each room. It is consulted once per join to seed
//! offers towards everyone already present; afterwards the signaling channel's `join`
//! and `leave` envelopes are authoritative.

use anyhow::{bail, Result};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use serde::{Deserialize, Serialize};

use crate::signaling::opt_id;
use crate::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub uid: PeerId,
    pub name: String,
}

#[async_trait]
pub trait Membership: Send + Sync {
    async fn announce_self(&self, id: &PeerId, name: &str, room: &str) -> Result<()>;
    async fn list_members(&self, room: &str) -> Result<Vec<Member>>;
    async fn withdraw(&self, id: &PeerId, name: &str, room: &str) -> Result<()>;
}

#[derive(Serialize)]
struct MemberBody<'a> {
    name: &'a str,
    room_name: &'a str,
    #[serde(rename = "UID")]
    uid: &'a str,
}

#[derive(Deserialize)]
struct RawMember {
    #[serde(default, deserialize_with = "opt_id")]
    uid: Option<String>,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<RawMember>,
}

/// Talks to the relay site's `/create_member/`, `/get_room_members/` and `/delete_member/` routes.
pub struct HttpMembership {
    base: String,
    client: Client<HttpConnector>,
}

impl HttpMembership {
    /// `base` is scheme and authority, e.g. `http://localhost:8000`
    pub fn new(base: impl Into<String>) -> Self {
        let http = HttpConnector::new();
        Self {
            base: base.into().trim_end_matches('/').to_owned(),
            client: Client::builder().build::<_, hyper::Body>(http),
        }
    }

    async fn post_member(&self, route: &str, id: &str, name: &str, room: &str) -> Result<()> {
        let payload = serde_json::to_string(&MemberBody {
            name,
            room_name: room,
            uid: id,
        })?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("{}/{}/", self.base, route))
            .header("content-type", "application/json; charset=utf-8")
            .body(Body::from(payload))?;
        let resp = self.client.request(req).await?;
        if !resp.status().is_success() {
            bail!("{} returned {}", route, resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl Membership for HttpMembership {
    async fn announce_self(&self, id: &PeerId, name: &str, room: &str) -> Result<()> {
        self.post_member("create_member", id, name, room).await
    }

    async fn list_members(&self, room: &str) -> Result<Vec<Member>> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!(
                "{}/get_room_members/?room_name={}",
                self.base,
                urlencoding::encode(room)
            ))
            .body(Body::empty())?;
        let resp = self.client.request(req).await?;
        if resp.status() != StatusCode::OK {
            bail!("get_room_members returned {}", resp.status());
        }
        let bytes = hyper::body::to_bytes(resp.into_body()).await?;
        let parsed: MembersResponse = serde_json::from_slice(&bytes)?;
        Ok(parsed
            .members
            .into_iter()
            .filter_map(|m| m.uid.map(|uid| Member { uid, name: m.name }))
            .collect())
    }

    async fn withdraw(&self, id: &PeerId, name: &str, room: &str) -> Result<()> {
        self.post_member("delete_member", id, name, room).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::Response;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(String, String)>>>;

    // stands in for the relay site
    async fn serve(seen: Seen) -> SocketAddr {
        let make = make_service_fn(move |_| {
            let seen = seen.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                    let seen = seen.clone();
                    async move {
                        let uri = req.uri().to_string();
                        let body = hyper::body::to_bytes(req.into_body()).await?;
                        seen.lock()
                            .unwrap()
                            .push((uri.clone(), String::from_utf8_lossy(&body).into_owned()));
                        let reply = if uri.starts_with("/get_room_members/") {
                            r#"{"members":[{"uid":"a1","name":"Ann"},{"uid":7,"name":"Bo"},{"name":"ghost"}]}"#
                        } else {
                            r#""ok""#
                        };
                        Ok::<_, hyper::Error>(Response::new(Body::from(reply)))
                    }
                }))
            }
        });
        let server = hyper::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn talks_to_relay_routes() {
        let seen = Seen::default();
        let addr = serve(seen.clone()).await;
        let membership = HttpMembership::new(format!("http://{}/", addr));

        membership
            .announce_self(&"a1".to_string(), "Ann", "ROOM 1")
            .await
            .unwrap();
        let members = membership.list_members("ROOM 1").await.unwrap();
        membership
            .withdraw(&"a1".to_string(), "Ann", "ROOM 1")
            .await
            .unwrap();

        assert_eq!(
            members,
            vec![
                Member {
                    uid: "a1".into(),
                    name: "Ann".into()
                },
                Member {
                    uid: "7".into(),
                    name: "Bo".into()
                },
            ]
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "/create_member/");
        let body: serde_json::Value = serde_json::from_str(&seen[0].1).unwrap();
        assert_eq!(body["UID"], "a1");
        assert_eq!(body["room_name"], "ROOM 1");
        assert_eq!(seen[1].0, "/get_room_members/?room_name=ROOM%201");
        assert_eq!(seen[2].0, "/delete_member/");
    }

    #[tokio::test]
    async fn unreachable_relay_is_an_error() {
        let membership = HttpMembership::new("http://127.0.0.1:9");
        assert!(membership.list_members("r").await.is_err());
    }
}
