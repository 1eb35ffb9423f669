use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Known thermometer/hygrometer models. The discriminant doubles as the
/// numeric tag written into log lines for the multi-probe models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DeviceModel {
    #[default]
    Unknown,
    H5055,
    H5072,
    H5074,
    H5075,
    H5100,
    H5101,
    H5104,
    H5105,
    H5174,
    H5177,
    H5179,
    H5181,
    H5182,
    H5183,
    H5184,
}

impl DeviceModel {
    pub fn tag(&self) -> u16 {
        match self {
            DeviceModel::Unknown => 0,
            DeviceModel::H5055 => 5055,
            DeviceModel::H5072 => 5072,
            DeviceModel::H5074 => 5074,
            DeviceModel::H5075 => 5075,
            DeviceModel::H5100 => 5100,
            DeviceModel::H5101 => 5101,
            DeviceModel::H5104 => 5104,
            DeviceModel::H5105 => 5105,
            DeviceModel::H5174 => 5174,
            DeviceModel::H5177 => 5177,
            DeviceModel::H5179 => 5179,
            DeviceModel::H5181 => 5181,
            DeviceModel::H5182 => 5182,
            DeviceModel::H5183 => 5183,
            DeviceModel::H5184 => 5184,
        }
    }

    /// Log lines only carry the tag for the meat-probe models; anything else
    /// maps back to Unknown on read.
    pub fn from_log_tag(tag: u16) -> Self {
        match tag {
            5181 => DeviceModel::H5181,
            5182 => DeviceModel::H5182,
            5183 => DeviceModel::H5183,
            5184 => DeviceModel::H5184,
            5055 => DeviceModel::H5055,
            _ => DeviceModel::Unknown,
        }
    }

    /// Display string written to persistence and cache files. The Unknown
    /// spelling matches what earlier releases wrote, so old files parse.
    pub fn label(&self) -> &'static str {
        match self {
            DeviceModel::Unknown => "(ThermometerType::Unknown)",
            DeviceModel::H5055 => "(GVH5055)",
            DeviceModel::H5072 => "(GVH5072)",
            DeviceModel::H5074 => "(GVH5074)",
            DeviceModel::H5075 => "(GVH5075)",
            DeviceModel::H5100 => "(GVH5100)",
            DeviceModel::H5101 => "(GVH5101)",
            DeviceModel::H5104 => "(GVH5104)",
            DeviceModel::H5105 => "(GVH5105)",
            DeviceModel::H5174 => "(GVH5174)",
            DeviceModel::H5177 => "(GVH5177)",
            DeviceModel::H5179 => "(GVH5179)",
            DeviceModel::H5181 => "(GVH5181)",
            DeviceModel::H5182 => "(GVH5182)",
            DeviceModel::H5183 => "(GVH5183)",
            DeviceModel::H5184 => "(GVH5184)",
        }
    }

    /// Recognize a model from an advertised local name, a persistence-file
    /// label, or a textual service UUID.
    pub fn from_name(text: &str) -> Self {
        for (pattern, model) in name_patterns() {
            if pattern.is_match(text) {
                return *model;
            }
        }
        DeviceModel::Unknown
    }

    /// Recognize a model from the 16-bit short of an advertised service UUID.
    pub fn from_service_uuid16(short: u16) -> Self {
        match short {
            0x8151 => DeviceModel::H5181,
            0x8251 => DeviceModel::H5182,
            0x8351 => DeviceModel::H5183,
            0x8451 => DeviceModel::H5184,
            0x5550 => DeviceModel::H5055,
            _ => DeviceModel::Unknown,
        }
    }

    pub fn is_meat_thermometer(&self) -> bool {
        matches!(
            self,
            DeviceModel::H5055
                | DeviceModel::H5181
                | DeviceModel::H5182
                | DeviceModel::H5183
                | DeviceModel::H5184
        )
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn name_patterns() -> &'static [(Regex, DeviceModel)] {
    static PATTERNS: OnceLock<Vec<(Regex, DeviceModel)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let table: &[(&str, DeviceModel)] = &[
            ("GVH5100", DeviceModel::H5100),
            ("GVH5101", DeviceModel::H5101),
            ("GVH5104", DeviceModel::H5104),
            ("GVH5105", DeviceModel::H5105),
            ("GVH5174", DeviceModel::H5174),
            ("GVH5177", DeviceModel::H5177),
            ("GVH5072", DeviceModel::H5072),
            ("GVH5075", DeviceModel::H5075),
            ("Govee_H5074|GVH5074", DeviceModel::H5074),
            ("Govee_H5179|GV5179|GVH5179", DeviceModel::H5179),
            (
                "GVH5181|00008151-0000-1000-8000-00805f9b34fb",
                DeviceModel::H5181,
            ),
            (
                "GVH5182|00008251-0000-1000-8000-00805f9b34fb",
                DeviceModel::H5182,
            ),
            (
                "GVH5183|00008351-0000-1000-8000-00805f9b34fb",
                DeviceModel::H5183,
            ),
            (
                "GVH5184|00008451-0000-1000-8000-00805f9b34fb",
                DeviceModel::H5184,
            ),
            (
                "GVH5055|00005550-0000-1000-8000-00805f9b34fb",
                DeviceModel::H5055,
            ),
        ];
        table
            .iter()
            .map(|(pattern, model)| (Regex::new(pattern).expect("model pattern"), *model))
            .collect()
    })
}

/// The Bluetooth base UUID with the 16-bit assigned number zeroed out.
const BLUETOOTH_BASE: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
];

/// The 16-bit assigned number of a UUID built on the Bluetooth base, if any.
pub fn uuid16(uuid: &Uuid) -> Option<u16> {
    let bytes = uuid.as_bytes();
    if bytes[0] != 0 || bytes[1] != 0 || bytes[4..] != BLUETOOTH_BASE[4..] {
        return None;
    }
    Some(u16::from_be_bytes([bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_advertised_names() {
        assert_eq!(DeviceModel::from_name("GVH5075_BCAE"), DeviceModel::H5075);
        assert_eq!(DeviceModel::from_name("Govee_H5074_5C0F"), DeviceModel::H5074);
        assert_eq!(DeviceModel::from_name("GVH5177_3B10"), DeviceModel::H5177);
        assert_eq!(DeviceModel::from_name("living room"), DeviceModel::Unknown);
    }

    #[test]
    fn recognizes_service_uuid_shorts() {
        assert_eq!(DeviceModel::from_service_uuid16(0x8251), DeviceModel::H5182);
        assert_eq!(DeviceModel::from_service_uuid16(0x5550), DeviceModel::H5055);
        assert_eq!(DeviceModel::from_service_uuid16(0x180F), DeviceModel::Unknown);
    }

    #[test]
    fn label_round_trips_through_name_match() {
        for model in [DeviceModel::H5074, DeviceModel::H5182, DeviceModel::H5055] {
            assert_eq!(DeviceModel::from_name(model.label()), model);
        }
    }

    #[test]
    fn uuid16_extraction() {
        let uuid: Uuid = "00008251-0000-1000-8000-00805f9b34fb".parse().unwrap();
        assert_eq!(uuid16(&uuid), Some(0x8251));
        let vendor: Uuid = "494e5445-4c4c-495f-524f-434b535f4857".parse().unwrap();
        assert_eq!(uuid16(&vendor), None);
    }
}
