use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};

use crate::core::image::{Image, ImageKind};
use crate::core::user::User;
use crate::core::CoreState;
use crate::runtime::RuntimeError;

#[derive(Debug, Error)]
pub enum ImageLookupError {
    #[error("image not found")]
    NotFound,
    #[error("image not available")]
    NotAvailable,
}

#[derive(Default)]
struct Tables {
    by_kind_name: HashMap<ImageKind, HashMap<String, Arc<Image>>>,
    by_id: HashMap<String, Arc<Image>>,
    // Kept aside so their remaining ContainerUsers can finish.
    removed: HashMap<String, Arc<Image>>,
}

/// The authoritative set of known images, reconciled against the runtime.
pub struct ImageRegistry {
    state: Arc<CoreState>,
    tables: Mutex<Tables>,
}

impl ImageRegistry {
    pub fn new(state: Arc<CoreState>) -> Self {
        let mut tables = Tables::default();
        for kind in ImageKind::ALL {
            tables.by_kind_name.insert(kind, HashMap::new());
        }
        Self {
            state,
            tables: Mutex::new(tables),
        }
    }

    pub fn state(&self) -> &Arc<CoreState> {
        &self.state
    }

    /// Diffs the runtime's labeled images against the current set by id. A
    /// single unparsable image is logged and skipped; a listing failure
    /// aborts the whole reconcile and the previous state is retained.
    pub async fn reconcile(&self) -> Result<(), RuntimeError> {
        let listed = self.state.runtime.list_labeled_images().await?;

        let mut tables = self.tables.lock().unwrap();

        let listed_ids: HashMap<&str, _> = listed.iter().map(|img| (img.id.as_str(), img)).collect();
        let stale: Vec<String> = tables
            .by_id
            .keys()
            .filter(|id| !listed_ids.contains_key(id.as_str()))
            .cloned()
            .collect();
        let fresh: Vec<_> = listed
            .iter()
            .filter(|img| !tables.by_id.contains_key(&img.id))
            .collect();
        info!("image update: {} to add, {} to remove", fresh.len(), stale.len());

        for img in fresh {
            let image = match Image::new(self.state.clone(), img) {
                Ok(image) => image,
                Err(err) => {
                    warn!("failed to parse image {}: {err}", img.id);
                    continue;
                }
            };
            tables.by_id.insert(image.runtime_id.clone(), image.clone());
            tables
                .by_kind_name
                .get_mut(&image.kind)
                .expect("kind table")
                .insert(image.name.clone(), image);
        }

        for id in stale {
            let Some(image) = tables.by_id.remove(&id) else {
                continue;
            };
            if let Some(by_name) = tables.by_kind_name.get_mut(&image.kind) {
                // Only drop the name entry if it still points at this id.
                if by_name.get(&image.name).is_some_and(|cur| cur.runtime_id == id) {
                    by_name.remove(&image.name);
                }
            }
            image.mark_removed();
            tables.removed.insert(id, image);
        }

        Ok(())
    }

    pub fn get_image(
        &self,
        kind: ImageKind,
        name: &str,
        user: &User,
    ) -> Result<Arc<Image>, ImageLookupError> {
        let image = self
            .tables
            .lock()
            .unwrap()
            .by_kind_name
            .get(&kind)
            .and_then(|by_name| by_name.get(name))
            .cloned()
            .ok_or(ImageLookupError::NotFound)?;
        if !image.is_visible_to(user) {
            return Err(ImageLookupError::NotAvailable);
        }
        Ok(image)
    }

    /// Snapshot of the images of one kind visible to the user.
    pub fn get_images(&self, kind: ImageKind, user: &User) -> HashMap<String, Arc<Image>> {
        let snapshot: HashMap<String, Arc<Image>> = self
            .tables
            .lock()
            .unwrap()
            .by_kind_name
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        snapshot
            .into_iter()
            .filter(|(_, image)| image.is_visible_to(user))
            .collect()
    }
}
