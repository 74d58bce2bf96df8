use std::collections::HashMap;

use hub_client::StateSnapshot;

/// Display name → participant id, as of the latest membership snapshot.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    by_name: HashMap<String, String>,
    self_id: Option<String>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole mapping from a snapshot (last write wins).
    ///
    /// Returns `false` when the snapshot carries no participant list, in which
    /// case the mapping is left untouched.
    pub fn replace(&mut self, snapshot: &StateSnapshot) -> bool {
        if let Some(id) = &snapshot.my_participant_id {
            self.self_id = Some(id.clone());
        }
        match &snapshot.participants {
            Some(participants) => {
                self.by_name = participants
                    .iter()
                    .map(|p| (p.name.clone(), p.id.clone()))
                    .collect();
                true
            }
            None => false,
        }
    }

    pub fn id_of(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }

    /// True for this client's own participant id, once the hub told us.
    pub fn is_self(&self, participant_id: &str) -> bool {
        self.self_id.as_deref() == Some(participant_id)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
