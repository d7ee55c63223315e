//! 元数据：附着在每个包上的 `键 → 多值` 映射，承载链路追踪、鉴权等横切信息。
//!
//! # 二进制布局（What）
//! 键按字典序升序输出，保证同一映射的编码结果确定：
//!
//! ```text
//! repeat {
//!     key_len(2, BE) value_count(2, BE) key(key_len)
//!     repeat value_count { value_len(2, BE) value(value_len) }
//! }
//! ```
//!
//! - 空映射编码为零字节；
//! - 解码遇到截断或越界长度时返回 [`ErrorCode::MetadataSize`]；解码先写入新映射，
//!   成功后才替换目标，失败时目标保持原状。
//!
//! 另提供 URL 编码形式（`k=v&k=v2`），供需要人工排障的传输使用，它不是默认线上格式，
//! 且无法表达“值列表为空”的键。

use std::collections::BTreeMap;
use std::collections::btree_map;

use bytes::{Buf, BufMut};
use url::form_urlencoded;

use crate::error::{ErrorCode, Result, RpcError};

/// 字符串键到多值列表的映射，键有序。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<String>>,
}

impl Metadata {
    /// 创建空映射。
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// 键的数量。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 读取某个键的全部值。
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// 读取某个键的首个值。
    pub fn get_first(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// 以新值列表覆盖某个键。
    pub fn set<K, I, V>(&mut self, key: K, values: I)
    where
        K: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.entries
            .insert(key.into(), values.into_iter().map(Into::into).collect());
    }

    /// 在某个键的值列表末尾追加一个值。
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .entry(key.into())
            .or_default()
            .push(value.into());
    }

    /// 移除某个键并返回其值列表。
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(key)
    }

    /// 清空映射。
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 按键序遍历。
    pub fn iter(&self) -> btree_map::Iter<'_, String, Vec<String>> {
        self.entries.iter()
    }

    /// 计算二进制编码后的字节数，不做长度合法性检查。
    pub fn encoded_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(key, values)| {
                4 + key.len() + values.iter().map(|value| 2 + value.len()).sum::<usize>()
            })
            .sum()
    }

    /// 编码为独立的字节向量。
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.marshal_into(&mut out)?;
        Ok(out)
    }

    /// 追加编码到 `out` 末尾；键、值长度或值个数超过 `u16::MAX` 时失败。
    pub fn marshal_into(&self, out: &mut Vec<u8>) -> Result<()> {
        for (key, values) in &self.entries {
            out.put_u16(length_u16(key.len(), "metadata key")?);
            out.put_u16(length_u16(values.len(), "metadata value count")?);
            out.put_slice(key.as_bytes());
            for value in values {
                out.put_u16(length_u16(value.len(), "metadata value")?);
                out.put_slice(value.as_bytes());
            }
        }
        Ok(())
    }

    /// 从二进制形式解码出新映射。
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut cursor = data;
        let mut entries = BTreeMap::new();
        while cursor.has_remaining() {
            let key_len = read_u16(&mut cursor)? as usize;
            let count = read_u16(&mut cursor)? as usize;
            let key = read_str(&mut cursor, key_len)?;
            let mut values = Vec::with_capacity(count.min(cursor.remaining() / 2));
            for _ in 0..count {
                let value_len = read_u16(&mut cursor)? as usize;
                values.push(read_str(&mut cursor, value_len)?);
            }
            entries.insert(key, values);
        }
        Ok(Self { entries })
    }

    /// 解码并替换 `self`；失败时 `self` 不被修改。
    pub fn unmarshal_into(&mut self, data: &[u8]) -> Result<()> {
        *self = Self::unmarshal(data)?;
        Ok(())
    }

    /// 生成 `application/x-www-form-urlencoded` 形式。
    pub fn to_url_encoded(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.entries {
            for value in values {
                serializer.append_pair(key, value);
            }
        }
        serializer.finish()
    }

    /// 解析 URL 编码形式，同名键按出现顺序累积。
    pub fn from_url_encoded(input: &str) -> Self {
        let mut metadata = Self::new();
        for (key, value) in form_urlencoded::parse(input.as_bytes()) {
            metadata.append(key.into_owned(), value.into_owned());
        }
        metadata
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut metadata = Self::new();
        for (key, value) in iter {
            metadata.append(key, value);
        }
        metadata
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = (&'a String, &'a Vec<String>);
    type IntoIter = btree_map::Iter<'a, String, Vec<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn length_u16(len: usize, what: &'static str) -> Result<u16> {
    u16::try_from(len).map_err(|_| {
        RpcError::new(
            ErrorCode::MetadataSize,
            format!("{what} length {len} exceeds {}", u16::MAX),
        )
    })
}

fn truncated() -> RpcError {
    RpcError::new(ErrorCode::MetadataSize, "metadata truncated")
}

fn read_u16(cursor: &mut &[u8]) -> Result<u16> {
    if cursor.remaining() < 2 {
        return Err(truncated());
    }
    Ok(cursor.get_u16())
}

fn read_str(cursor: &mut &[u8], len: usize) -> Result<String> {
    if cursor.remaining() < len {
        return Err(truncated());
    }
    let whole = *cursor;
    let (head, tail) = whole.split_at(len);
    *cursor = tail;
    String::from_utf8(head.to_vec()).map_err(|err| {
        RpcError::new(ErrorCode::Unmarshal, "metadata is not valid utf-8").with_cause(err)
    })
}
