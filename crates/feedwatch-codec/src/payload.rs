use bytes::Bytes;
use feedwatch_core::{
    DomainType, GroupId, Qos, ServiceId, State, FILTER_DATA, FILTER_GROUP, FILTER_INFO,
    FILTER_LINK, FILTER_LOAD, FILTER_STATE,
};
use serde::{Deserialize, Serialize};

/// Action applied to one entry of a map-shaped payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapAction {
    Add,
    Update,
    Delete,
}

/// One symbol-list map entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub symbol: String,
    pub action: MapAction,
}

impl SymbolEntry {
    pub fn add(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            action: MapAction::Add,
        }
    }

    pub fn delete(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            action: MapAction::Delete,
        }
    }
}

/// Data-stream behavior requested alongside a symbol-list request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolListBehavior {
    /// Only the symbol names are delivered; no item streams are opened.
    #[default]
    NamesOnly,
    /// Open a streaming item request per symbol.
    DataStreams,
    /// Open a snapshot item request per symbol.
    DataSnapshots,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub vendor: Option<String>,
    pub capabilities: Vec<DomainType>,
    pub qos: Vec<Qos>,
    pub supports_qos_range: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_up: bool,
    pub accepting_requests: Option<bool>,
    /// State applied to every item of the service when present.
    pub status: Option<State>,
}

impl ServiceStatus {
    pub fn up() -> Self {
        Self {
            service_up: true,
            accepting_requests: Some(true),
            status: None,
        }
    }

    pub fn down() -> Self {
        Self {
            service_up: false,
            accepting_requests: None,
            status: None,
        }
    }

    /// Whether new item requests may be sent to the service.
    pub fn is_available(&self) -> bool {
        self.service_up && self.accepting_requests.unwrap_or(true)
    }
}

/// Item group status change, optionally merging the group into another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub group: GroupId,
    pub status: Option<State>,
    pub merged_to: Option<GroupId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLoad {
    pub open_limit: Option<u32>,
    /// Max concurrently outstanding item requests.
    pub open_window: Option<u32>,
    pub load_factor: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLink {
    pub name: String,
    pub link_up: bool,
    pub text: Option<String>,
}

/// One service of a source directory refresh/update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub service_id: ServiceId,
    pub action: MapAction,
    pub info: Option<ServiceInfo>,
    pub state: Option<ServiceStatus>,
    pub groups: Vec<ServiceGroup>,
    pub load: Option<ServiceLoad>,
    pub data: Option<Bytes>,
    pub links: Option<Vec<ServiceLink>>,
}

impl ServiceEntry {
    pub fn new(service_id: ServiceId, action: MapAction) -> Self {
        Self {
            service_id,
            action,
            info: None,
            state: None,
            groups: Vec::new(),
            load: None,
            data: None,
            links: None,
        }
    }

    /// Filter bits carried by this entry.
    pub fn filter_mask(&self) -> u32 {
        let mut mask = 0;
        if self.info.is_some() {
            mask |= FILTER_INFO;
        }
        if self.state.is_some() {
            mask |= FILTER_STATE;
        }
        if !self.groups.is_empty() {
            mask |= FILTER_GROUP;
        }
        if self.load.is_some() {
            mask |= FILTER_LOAD;
        }
        if self.data.is_some() {
            mask |= FILTER_DATA;
        }
        if self.links.is_some() {
            mask |= FILTER_LINK;
        }
        mask
    }

    /// Copy of this entry keeping only the blocks selected by `mask`.
    pub fn filtered(&self, mask: u32) -> ServiceEntry {
        ServiceEntry {
            service_id: self.service_id,
            action: self.action,
            info: self.info.clone().filter(|_| mask & FILTER_INFO != 0),
            state: self.state.clone().filter(|_| mask & FILTER_STATE != 0),
            groups: if mask & FILTER_GROUP != 0 {
                self.groups.clone()
            } else {
                Vec::new()
            },
            load: self.load.clone().filter(|_| mask & FILTER_LOAD != 0),
            data: self.data.clone().filter(|_| mask & FILTER_DATA != 0),
            links: self.links.clone().filter(|_| mask & FILTER_LINK != 0),
        }
    }
}

/// Login attributes the watchlist reasons about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAttribs {
    pub user_name: Option<String>,
    pub application_id: Option<String>,
    pub single_open: Option<bool>,
    pub allow_suspect_data: Option<bool>,
}

/// Container carried by a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    #[default]
    None,
    Opaque(Bytes),
    SymbolMap(Vec<SymbolEntry>),
    Directory(Vec<ServiceEntry>),
    Login(LoginAttribs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_mask_tracks_present_blocks() {
        let mut entry = ServiceEntry::new(1, MapAction::Add);
        assert_eq!(entry.filter_mask(), 0);
        entry.info = Some(ServiceInfo {
            name: "DIRECT_FEED".into(),
            ..ServiceInfo::default()
        });
        entry.state = Some(ServiceStatus::up());
        assert_eq!(entry.filter_mask(), FILTER_INFO | FILTER_STATE);
    }

    #[test]
    fn filtered_drops_unselected_blocks() {
        let mut entry = ServiceEntry::new(1, MapAction::Update);
        entry.state = Some(ServiceStatus::up());
        entry.load = Some(ServiceLoad {
            open_window: Some(2),
            ..ServiceLoad::default()
        });
        entry.groups.push(ServiceGroup {
            group: GroupId::from_u16(1),
            status: None,
            merged_to: None,
        });
        let narrowed = entry.filtered(FILTER_STATE);
        assert_eq!(narrowed.filter_mask(), FILTER_STATE);
        assert_eq!(narrowed.service_id, 1);
        assert_eq!(narrowed.action, MapAction::Update);
    }

    #[test]
    fn service_availability() {
        assert!(ServiceStatus::up().is_available());
        assert!(!ServiceStatus::down().is_available());
        let mut busy = ServiceStatus::up();
        busy.accepting_requests = Some(false);
        assert!(!busy.is_available());
    }
}
