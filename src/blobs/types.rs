//! 色块数据类型
//! Blob candidates, color code modes and output records

use phf::phf_map;
use serde::{Deserialize, Serialize};

// ========== 常量 ==========

/// 颜色签名数量 (1..=7)
pub const CL_NUM_SIGNATURES: u8 = 7;
pub const MAX_BLOBS: usize = 100;
pub const MAX_BLOBS_PER_MODEL: usize = 20;
pub const MAX_MERGE_DIST: u16 = 7;
pub const MIN_AREA: u32 = 20;
pub const MIN_COLOR_CODE_AREA: u32 = 10;
pub const MAX_CODED_DIST: u16 = 8;
/// 色码最多由 5 个色块组成
pub const MAX_COLOR_CODE_MODELS: usize = 5;
pub const BL_BLOB_FILTERING: u16 = 3;
pub const BL_MAX_TRACKING_DIST: u16 = 65;
/// 帧周期 (us), 首帧的速度归一化使用
pub const BL_PERIOD_US: u64 = 16200;

// ========== 色码模式 ==========

/// 色码处理模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorCodeMode {
    Disabled,
    #[default]
    Enabled,
    CcOnly,
    Mixed,
}

/// 模式名称 → 模式编号
static COLOR_CODE_MODES: phf::Map<&'static str, u8> = phf_map! {
    "disabled" => 0,
    "enabled" => 1,
    "cc_only" => 2,
    "mixed" => 3,
};

impl ColorCodeMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ColorCodeMode::Disabled),
            1 => Some(ColorCodeMode::Enabled),
            2 => Some(ColorCodeMode::CcOnly),
            3 => Some(ColorCodeMode::Mixed),
            _ => None,
        }
    }

    /// 按名称查找模式 (不区分大小写)
    pub fn from_name(name: &str) -> Option<Self> {
        COLOR_CODE_MODES
            .get(name.to_ascii_lowercase().as_str())
            .and_then(|v| Self::from_u8(*v))
    }

    pub fn name(self) -> &'static str {
        match self {
            ColorCodeMode::Disabled => "disabled",
            ColorCodeMode::Enabled => "enabled",
            ColorCodeMode::CcOnly => "cc_only",
            ColorCodeMode::Mixed => "mixed",
        }
    }
}

// ========== 签名表 ==========

/// 分类器签名表: 每个签名是否参与色码
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureTable {
    color_code: [bool; CL_NUM_SIGNATURES as usize],
}

impl SignatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从位图构造 (bit0 = 签名1)
    pub fn from_bits(bits: u8) -> Self {
        let mut table = Self::default();
        for sig in 1..=CL_NUM_SIGNATURES {
            table.set_color_code(sig, bits & (1 << (sig - 1)) != 0);
        }
        table
    }

    pub fn set_color_code(&mut self, signature: u8, enabled: bool) {
        if (1..=CL_NUM_SIGNATURES).contains(&signature) {
            self.color_code[(signature - 1) as usize] = enabled;
        }
    }

    pub fn is_color_code(&self, signature: u8) -> bool {
        (1..=CL_NUM_SIGNATURES).contains(&signature)
            && self.color_code[(signature - 1) as usize]
    }

    /// 在给定模式下签名是否参与色码
    pub fn cc_signature(&self, mode: ColorCodeMode, signature: u8) -> bool {
        mode == ColorCodeMode::CcOnly || self.is_color_code(signature)
    }
}

// ========== 色块候选 ==========

/// 本帧色块候选 (model 为 0 表示已失效)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlobCandidate {
    pub model: u16,
    pub left: u16,
    pub right: u16,
    pub top: u16,
    pub bottom: u16,
    pub angle: i16,
    pub tracker: Option<u16>, // 对应的跟踪ID
}

impl BlobCandidate {
    pub fn new(model: u16, left: u16, right: u16, top: u16, bottom: u16) -> Self {
        Self {
            model,
            left,
            right,
            top,
            bottom,
            angle: 0,
            tracker: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.model != 0
    }

    pub fn invalidate(&mut self) {
        self.model = 0;
    }

    /// 低 3 位签名
    pub fn signature(&self) -> u8 {
        (self.model & 0x07) as u8
    }

    pub fn is_color_code(&self) -> bool {
        self.model > CL_NUM_SIGNATURES as u16
    }

    pub fn area(&self) -> u32 {
        (self.right.saturating_sub(self.left) as u32)
            * (self.bottom.saturating_sub(self.top) as u32)
    }

    pub fn center(&self) -> (u16, u16) {
        ((self.left + self.right) >> 1, (self.top + self.bottom) >> 1)
    }

    /// 是否完全包含另一个色块
    pub fn contains(&self, other: &BlobCandidate) -> bool {
        self.left <= other.left
            && self.right >= other.right
            && self.top <= other.top
            && self.bottom >= other.bottom
    }
}

// ========== 输出记录 ==========

/// 对外输出的色块 (中心 + 尺寸)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BlobRecord {
    pub model: u16,
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub angle: i16,
    pub index: u16, // 跟踪ID
    pub age: u8,
}

impl BlobRecord {
    pub fn from_blob(blob: &BlobCandidate, index: u16, age: u8) -> Self {
        let (x, y) = blob.center();
        Self {
            model: blob.model,
            x,
            y,
            width: blob.right.saturating_sub(blob.left),
            height: blob.bottom.saturating_sub(blob.top),
            angle: blob.angle,
            index,
            age,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_name() {
        assert_eq!(ColorCodeMode::from_name("mixed"), Some(ColorCodeMode::Mixed));
        assert_eq!(ColorCodeMode::from_name("CC_ONLY"), Some(ColorCodeMode::CcOnly));
        assert_eq!(ColorCodeMode::from_name("sometimes"), None);
        assert_eq!(ColorCodeMode::Mixed.name(), "mixed");
    }

    #[test]
    fn test_cc_signature() {
        let table = SignatureTable::from_bits(0b0000_0011);
        assert!(table.cc_signature(ColorCodeMode::Enabled, 1));
        assert!(table.cc_signature(ColorCodeMode::Enabled, 2));
        assert!(!table.cc_signature(ColorCodeMode::Enabled, 3));
        assert!(table.cc_signature(ColorCodeMode::CcOnly, 3));
        assert!(!table.is_color_code(0));
    }

    #[test]
    fn test_record_from_blob() {
        let mut blob = BlobCandidate::new(2, 10, 30, 4, 14);
        blob.angle = -45;
        let rec = BlobRecord::from_blob(&blob, 9, 3);
        assert_eq!((rec.x, rec.y, rec.width, rec.height), (20, 9, 20, 10));
        assert_eq!((rec.angle, rec.index, rec.age), (-45, 9, 3));
    }
}
