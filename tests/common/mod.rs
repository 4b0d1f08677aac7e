//! Shared fixtures: an in-memory directory, a throwaway CA, and step-up stubs.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use base64::Engine;
use time::{Duration, OffsetDateTime};

use kubetoken::config::DirectoryConfig;
use kubetoken::directory::{
    Directory, DirectoryConn, DirectoryConnector, DirectoryEntry, DirectoryError, SearchRequest,
};
use kubetoken::environment::{Environment, Environments, SigningContext};
use kubetoken::pki::{self, GeneratedCert};
use kubetoken::server::AppState;
use kubetoken::step_up::{StepUpAuthenticator, StepUpError};

pub const ROLE: &str = "kube-acme-default-dev-dl-admin";
pub const PASSWORD: &str = "hunter2";

/// Directory that answers every search with the same `cn` entries.
#[derive(Default)]
pub struct StaticDirectory {
    pub members: Vec<String>,
    pub binds: AtomicUsize,
}

impl StaticDirectory {
    pub fn with_members(members: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            members: members.iter().map(|m| (*m).to_string()).collect(),
            binds: AtomicUsize::new(0),
        })
    }

    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }
}

struct StaticConn {
    entries: Vec<DirectoryEntry>,
}

#[async_trait]
impl DirectoryConn for StaticConn {
    async fn search(&mut self, _request: &SearchRequest) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        Ok(self.entries.clone())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl DirectoryConnector for StaticDirectory {
    async fn bind(&self, _bind_dn: &str, password: &str) -> Result<Box<dyn DirectoryConn>, DirectoryError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        if password != PASSWORD {
            return Err(DirectoryError::Bind("invalid credentials".to_string()));
        }
        Ok(Box::new(StaticConn {
            entries: self
                .members
                .iter()
                .map(|cn| DirectoryEntry {
                    dn: format!("CN={cn},OU=people,DC=example,DC=com"),
                    attrs: vec![("cn".to_string(), vec![cn.clone()])],
                })
                .collect(),
        }))
    }
}

/// Step-up stub with a fixed answer.
pub struct StubStepUp {
    pub approve: bool,
    pub calls: AtomicUsize,
}

impl StubStepUp {
    pub fn new(approve: bool) -> Arc<Self> {
        Arc::new(Self {
            approve,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepUpAuthenticator for StubStepUp {
    async fn authenticate(&self, _principal: &str) -> Result<(), StepUpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.approve {
            Ok(())
        } else {
            Err(StepUpError::Denied {
                status: "deny".to_string(),
                message: "Login request denied.".to_string(),
            })
        }
    }
}

pub fn test_ca() -> GeneratedCert {
    pki::new_ca("kubetoken test CA", OffsetDateTime::now_utc() + Duration::days(30)).unwrap()
}

/// `acme/dev` with one context holding clusters `b` and `a`.
pub fn acme_dev(ca: &GeneratedCert) -> Environments {
    let clusters = BTreeMap::from([
        ("b".to_string(), "https://b.dev.acme.example.com:6443".to_string()),
        ("a".to_string(), "https://a.dev.acme.example.com:6443".to_string()),
    ]);
    let context =
        SigningContext::from_pem(ca.cert_pem.as_bytes(), ca.key_pem.as_bytes(), None, clusters).unwrap();
    Environments::new(vec![Environment::new("acme", "dev", vec![context]).unwrap()])
}

pub fn app_state(
    directory: Arc<StaticDirectory>,
    step_up: Option<Arc<dyn StepUpAuthenticator>>,
    environments: Environments,
) -> Arc<AppState> {
    Arc::new(AppState {
        directory: Directory::new(DirectoryConfig::default(), directory),
        step_up,
        environments,
    })
}

pub fn basic(user: &str, password: &str) -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"))
    )
}

/// Serve `router` on an ephemeral port and return its base URL.
pub async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}
