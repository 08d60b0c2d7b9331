// 任务标识与快速指纹
//
// 快速指纹 = md5("名称-修改时间-大小")，在计算完整内容 MD5 之前用于去重。

use md5::Context as Md5Context;
use uuid::Uuid;

/// 默认任务 ID 前缀
pub const TASK_ID_PREFIX: &str = "task";

/// 生成任务 ID
///
/// 格式：`{prefix}-{uuid v4}`，前缀为空时只返回 uuid
pub fn generate_task_id(prefix: Option<&str>) -> String {
    let uuid = Uuid::new_v4().to_string();
    match prefix {
        Some(p) if !p.is_empty() => format!("{}-{}", p, uuid),
        _ => uuid,
    }
}

/// 计算快速指纹
///
/// # 参数
/// * `name` - 文件名
/// * `size` - 文件大小（字节）
/// * `modified_at` - 修改时间（Unix 毫秒），未知时按 0 处理
pub fn quick_fingerprint(name: &str, size: u64, modified_at: Option<i64>) -> String {
    let features = format!("{}-{}-{}", name, modified_at.unwrap_or(0), size);
    let mut ctx = Md5Context::new();
    ctx.consume(features.as_bytes());
    format!("{:x}", ctx.compute())
}

/// 获取文件后缀（最后一个 `.` 之后的部分，不含 `.`）
pub fn file_extension(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_format() {
        let id = generate_task_id(Some(TASK_ID_PREFIX));
        assert!(id.starts_with("task-"));
        assert_eq!(id.len(), "task-".len() + 36);

        let bare = generate_task_id(None);
        assert_eq!(bare.len(), 36);
        assert_ne!(generate_task_id(None), bare);
    }

    #[test]
    fn test_quick_fingerprint_deterministic() {
        let a = quick_fingerprint("movie.mkv", 1024, Some(1_617_000_000_000));
        let b = quick_fingerprint("movie.mkv", 1024, Some(1_617_000_000_000));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        // 任一特征变化都会改变指纹
        assert_ne!(a, quick_fingerprint("movie.mkv", 1025, Some(1_617_000_000_000)));
        assert_ne!(a, quick_fingerprint("movie.mkv", 1024, Some(1_617_000_000_001)));
        assert_ne!(a, quick_fingerprint("movie2.mkv", 1024, Some(1_617_000_000_000)));
    }

    #[test]
    fn test_quick_fingerprint_matches_md5_of_features() {
        let expected = format!("{:x}", md5::compute(b"a.txt-0-3"));
        assert_eq!(quick_fingerprint("a.txt", 3, None), expected);
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("archive.tar.gz"), "gz");
        assert_eq!(file_extension("photo.JPG"), "JPG");
        assert_eq!(file_extension("README"), "");
        assert_eq!(file_extension("trailing."), "");
        assert_eq!(file_extension(".bashrc"), "bashrc");
    }
}
