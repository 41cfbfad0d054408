//! Roster manager. The single writer of the known-people list.
//!
//! Readers never see the mutable list: [`RosterManager::list`] and
//! [`RosterManager::subscribe`] hand out `Arc` snapshots, so a change made
//! while a recognition call is in flight cannot alter that call's gallery.

use crate::store::{RosterStore, StoreError};
use crate::types::{EncodedImage, Gallery, KnownPerson};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("failed to persist roster: {0}")]
    Store(#[from] StoreError),
}

pub struct RosterManager<S: RosterStore> {
    store: S,
    people: watch::Sender<Gallery>,
}

impl<S: RosterStore> RosterManager<S> {
    /// Load the persisted roster. A failed load is logged and yields an
    /// empty roster; it never aborts startup.
    pub fn open(store: S) -> Self {
        let people = match store.load_roster() {
            Ok(people) => {
                tracing::info!(count = people.len(), "roster loaded");
                people
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load roster; starting empty");
                Vec::new()
            }
        };
        let (tx, _) = watch::channel(Gallery::from(people));
        Self { store, people: tx }
    }

    /// Register a person with a fresh id and persist the updated roster.
    ///
    /// If persisting fails the in-memory roster is left unchanged.
    pub fn add(&mut self, name: &str, image: EncodedImage) -> Result<KnownPerson, RosterError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RosterError::EmptyName);
        }

        let person = KnownPerson {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            image: image.data,
            mime: image.mime,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let mut next: Vec<KnownPerson> = self.people.borrow().to_vec();
        next.push(person.clone());
        self.commit(next)?;

        tracing::info!(id = %person.id, name = %person.name, "person added");
        Ok(person)
    }

    /// Remove the person with `id`. Returns whether anyone was removed.
    pub fn remove(&mut self, id: &str) -> Result<bool, RosterError> {
        let current = self.list();
        let next: Vec<KnownPerson> = current.iter().filter(|p| p.id != id).cloned().collect();
        if next.len() == current.len() {
            return Ok(false);
        }
        self.commit(next)?;
        tracing::info!(id, "person removed");
        Ok(true)
    }

    /// Read-only snapshot of the current roster.
    pub fn list(&self) -> Gallery {
        Arc::clone(&self.people.borrow())
    }

    /// Receive a fresh snapshot every time the roster changes.
    pub fn subscribe(&self) -> watch::Receiver<Gallery> {
        self.people.subscribe()
    }

    fn commit(&mut self, next: Vec<KnownPerson>) -> Result<(), RosterError> {
        self.store.save_roster(&next)?;
        self.people.send_replace(Gallery::from(next));
        Ok(())
    }
}
