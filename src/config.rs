//! 视觉引擎配置 - 通过JSON文件调整参数
//! Engine configuration, loaded from and saved to JSON

use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::blobs::types::{
    ColorCodeMode, SignatureTable, BL_BLOB_FILTERING, BL_MAX_TRACKING_DIST, MAX_BLOBS,
    MAX_BLOBS_PER_MODEL, MAX_CODED_DIST, MAX_MERGE_DIST, MIN_AREA,
};

/// 运行的检测程序
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Program {
    /// 色块 + 色码
    #[default]
    Blobs,
    /// 线 + 交叉点 + 条码
    Lines,
}

/// 色块检测参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    pub max_blobs: usize,           // 每帧最大色块数
    pub max_blobs_per_model: usize, // 每个签名最大色块数
    pub min_area: u32,              // 最小面积
    pub merge_dist: u16,            // 相邻合并容差
    pub color_code_mode: ColorCodeMode,
    pub color_code_signatures: u8, // 参与色码的签名位图 (bit0 = 签名1)
    pub filtering: u16,            // 滤波等级 (×16ms)
    pub max_velocity: u16,         // 最大跟踪速度
    pub max_coded_dist: u16,       // 色码成员最大间距
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            max_blobs: MAX_BLOBS,
            max_blobs_per_model: MAX_BLOBS_PER_MODEL,
            min_area: MIN_AREA,
            merge_dist: MAX_MERGE_DIST,
            color_code_mode: ColorCodeMode::Enabled,
            color_code_signatures: 0,
            filtering: BL_BLOB_FILTERING,
            max_velocity: BL_MAX_TRACKING_DIST,
            max_coded_dist: MAX_CODED_DIST,
        }
    }
}

impl BlobConfig {
    pub fn signature_table(&self) -> SignatureTable {
        SignatureTable::from_bits(self.color_code_signatures)
    }
}

/// 线检测参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    // === 边沿 ===
    pub edge_distance: u16,  // 边沿中心补偿
    pub edge_threshold: u16, // 边沿检测阈值 (由边沿源使用)
    pub min_line_width: u16,
    pub max_line_width: u16,

    // === 提取与拓扑 ===
    pub min_line_length: u16,
    pub max_merge_dist: u16,
    pub extraction_dist: u16, // 提取距离 (由边沿源使用)
    pub max_line_compare: u32,
    pub max_code_dist: u32, // 条码聚类距离平方

    // === 跟踪 ===
    pub line_filtering: u16,
    pub intersection_filtering: u16,
    pub barcode_filtering: u16,

    // === 模式 ===
    pub white_line: bool,
    pub manual_vector_select: bool,
    pub delayed_turn: bool,
    pub default_turn_angle: i16,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            edge_distance: 4,
            edge_threshold: 35,
            min_line_width: 0,
            max_line_width: 100,

            min_line_length: 10,
            max_merge_dist: 6,
            extraction_dist: 13,
            max_line_compare: 5000,
            max_code_dist: 225,

            line_filtering: 1,
            intersection_filtering: 1,
            barcode_filtering: 1,

            white_line: false,
            manual_vector_select: false,
            delayed_turn: false,
            default_turn_angle: 0,
        }
    }
}

/// 引擎总配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub program: Program,
    pub queue_capacity: usize,  // 事件队列容量
    pub frame_timeout_ms: u64,  // 等待事件的超时
    pub blobs: BlobConfig,
    pub lines: LineConfig,
}

/// 默认队列容量 (事件个数)
pub const DEFAULT_QUEUE_CAPACITY: usize = 0x4000;
/// 默认事件超时 (ms)
pub const DEFAULT_FRAME_TIMEOUT_MS: u64 = 100;

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            program: Program::Blobs,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT_MS,
            blobs: BlobConfig::default(),
            lines: LineConfig::default(),
        }
    }
}

impl VisionConfig {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            ..Self::default()
        }
    }

    /// 从JSON文件加载配置, 文件不存在时写入默认配置
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str::<VisionConfig>(&json) {
                Ok(config) => {
                    info!("✅ 配置已从 {} 加载", path.display());
                    config.normalized()
                }
                Err(e) => {
                    warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("❌ 保存配置失败: {:#}", e);
                }
                config
            }
        }
    }

    /// 严格加载, 任何错误都返回
    pub fn try_load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config: VisionConfig = serde_json::from_str(&json)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config.normalized())
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, json).with_context(|| format!("写入配置文件失败: {}", path.display()))?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    /// 修正缺省为 0 的运行参数
    fn normalized(mut self) -> Self {
        if self.queue_capacity == 0 {
            self.queue_capacity = DEFAULT_QUEUE_CAPACITY;
        }
        if self.frame_timeout_ms == 0 {
            self.frame_timeout_ms = DEFAULT_FRAME_TIMEOUT_MS;
        }
        self
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️  当前视觉配置:");
        info!("  程序: {:?}", self.program);
        info!(
            "  事件队列: {} 超时: {}ms",
            self.queue_capacity, self.frame_timeout_ms
        );
        match self.program {
            Program::Blobs => {
                let b = &self.blobs;
                info!(
                    "  色块: 最大 {} 每签名 {} 最小面积 {} 合并距离 {}",
                    b.max_blobs, b.max_blobs_per_model, b.min_area, b.merge_dist
                );
                info!(
                    "  色码模式: {} 签名位图: {:#04x} 滤波: {} 最大速度: {}",
                    b.color_code_mode.name(),
                    b.color_code_signatures,
                    b.filtering,
                    b.max_velocity
                );
            }
            Program::Lines => {
                let l = &self.lines;
                info!(
                    "  线宽: ({}, {}) 最小线长: {} 合并距离: {}",
                    l.min_line_width, l.max_line_width, l.min_line_length, l.max_merge_dist
                );
                info!(
                    "  滤波: 线 {} 交叉点 {} 条码 {}",
                    l.line_filtering, l.intersection_filtering, l.barcode_filtering
                );
                info!(
                    "  白线: {} 手动选择: {} 延迟转向: {} 默认转向角: {}",
                    l.white_line, l.manual_vector_select, l.delayed_turn, l.default_turn_angle
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "program": "lines", "lines": { "white_line": true } }"#;
        let config: VisionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.program, Program::Lines);
        assert!(config.lines.white_line);
        assert_eq!(config.lines.max_line_width, 100);
        assert_eq!(config.blobs.merge_dist, MAX_MERGE_DIST);
    }

    #[test]
    fn test_color_code_mode_serde() {
        let json = r#"{ "blobs": { "color_code_mode": "mixed", "color_code_signatures": 3 } }"#;
        let config: VisionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.blobs.color_code_mode, ColorCodeMode::Mixed);
        assert!(config.blobs.signature_table().is_color_code(2));
        assert!(!config.blobs.signature_table().is_color_code(3));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("pixytrack-config-{}.json", std::process::id()));
        let mut config = VisionConfig::new(Program::Lines);
        config.lines.default_turn_angle = -90;
        config.save(&path).unwrap();
        let loaded = VisionConfig::try_load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_writes_defaults() {
        let path = std::env::temp_dir().join(format!("pixytrack-missing-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);
        let config = VisionConfig::load(&path);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(path.exists());
        let _ = fs::remove_file(&path);
    }
}
