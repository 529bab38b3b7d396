use std::collections::HashMap;

use super::track::Track;

/// Difference between the live library and a stored projection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackDelta {
    pub new_ids: Vec<String>,
    pub updated_ids: Vec<String>,
    pub removed_ids: Vec<String>,
}

impl TrackDelta {
    pub fn is_empty(&self) -> bool {
        self.new_ids.is_empty() && self.updated_ids.is_empty() && self.removed_ids.is_empty()
    }

    pub fn has_updates(&self) -> bool {
        !self.new_ids.is_empty() || !self.updated_ids.is_empty()
    }

    pub fn has_removals(&self) -> bool {
        !self.removed_ids.is_empty()
    }
}

/// Compares a live track against its stored counterpart on the fields the
/// delta cares about. `track_status` only counts when both sides carry a
/// value, so the first scan after the status field was introduced does not
/// flag the whole library as updated.
pub fn has_track_changed(live: &Track, stored: &Track) -> bool {
    let modified_changed = !live.last_modified.is_empty() && live.last_modified != stored.last_modified;
    let added_changed = !live.date_added.is_empty() && live.date_added != stored.date_added;
    let status_changed = !live.track_status.is_empty()
        && !stored.track_status.is_empty()
        && live.track_status != stored.track_status;

    modified_changed || added_changed || status_changed
}

/// Pure set math between the live track list and the stored projection.
/// All three id lists come back sorted so two identical inputs always
/// produce identical output.
pub fn compute_track_delta(live: &[Track], stored: &HashMap<String, Track>) -> TrackDelta {
    let live_map: HashMap<&str, &Track> = live.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut new_ids: Vec<String> = live_map
        .keys()
        .filter(|id| !stored.contains_key(**id))
        .map(|id| id.to_string())
        .collect();
    new_ids.sort();

    let mut removed_ids: Vec<String> = stored
        .keys()
        .filter(|id| !live_map.contains_key(id.as_str()))
        .cloned()
        .collect();
    removed_ids.sort();

    let mut updated_ids: Vec<String> = live_map
        .iter()
        .filter(|(id, live_track)| {
            stored
                .get(**id)
                .is_some_and(|stored_track| has_track_changed(live_track, stored_track))
        })
        .map(|(id, _)| id.to_string())
        .collect();
    updated_ids.sort();

    TrackDelta { new_ids, updated_ids, removed_ids }
}
