//! 协议版本协商

use std::collections::BTreeSet;
use tracing::warn;

/// 单个区间允许展开的最大版本数
const MAX_RANGE_WIDTH: u32 = 64;

/// 解析版本列表
///
/// 支持逗号分隔的单个版本和 `min-max` 区间，例如 `"1,3-5"` -> `{1,3,4,5}`。
/// 格式错误的条目记录日志后跳过。
pub fn parse_version_list(s: &str) -> BTreeSet<u32> {
    let mut versions = BTreeSet::new();

    for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('-') {
            Some((min, max)) => {
                let (Ok(min), Ok(max)) = (min.trim().parse::<u32>(), max.trim().parse::<u32>())
                else {
                    warn!("Skipping malformed version range: {}", entry);
                    continue;
                };
                if min > max || max - min >= MAX_RANGE_WIDTH {
                    warn!("Skipping invalid version range: {}", entry);
                    continue;
                }
                versions.extend(min..=max);
            }
            None => match entry.parse::<u32>() {
                Ok(v) => {
                    versions.insert(v);
                }
                Err(_) => warn!("Skipping malformed version entry: {}", entry),
            },
        }
    }

    versions
}

/// 计算双方都支持的最高版本
///
/// 按服务端版本降序遍历，返回第一个客户端也支持的版本
pub fn highest_common(server_versions: &BTreeSet<u32>, client_versions: &BTreeSet<u32>) -> Option<u32> {
    server_versions
        .iter()
        .rev()
        .find(|v| client_versions.contains(v))
        .copied()
}

/// 把版本集合格式化为 `ver=` 字段，连续版本合并为区间
pub fn format_version_list(versions: &BTreeSet<u32>) -> String {
    let mut parts = Vec::new();
    let mut iter = versions.iter().copied().peekable();

    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(&next) = iter.peek() {
            if next != end + 1 {
                break;
            }
            end = next;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }

    parts.join(",")
}
