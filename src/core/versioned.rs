//! 版本化实体包装
//!
//! 所有写操作都经由 [`Versioned::update`] 完成：执行闭包、版本号 +1、同步触发一次变更回调。
//! 嵌套字段与数组操作同样走 update，因此一次逻辑修改只通知一次。
//!
//! 注意：只追踪经由句柄的修改。被包装之前的原值若被调用方另行持有并修改，不会触发通知；
//! 调用方应只通过返回的句柄修改。

use std::fmt;
use std::ops::RangeBounds;
use std::sync::Arc;

/// 变更回调：参数为修改后的值与新版本号
pub type ChangeCallback<T> = Arc<dyn Fn(&T, u64) + Send + Sync>;

/// 带版本号与变更回调的值包装
pub struct Versioned<T> {
    value: T,
    version: u64,
    on_change: Option<ChangeCallback<T>>,
}

impl<T> Versioned<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            version: 0,
            on_change: None,
        }
    }

    pub fn with_callback(value: T, on_change: ChangeCallback<T>) -> Self {
        Self {
            value,
            version: 0,
            on_change: Some(on_change),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// 一次逻辑修改：闭包内可任意改动嵌套字段，结束后版本 +1 并通知一次
    pub fn update<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        let out = f(&mut self.value);
        self.version += 1;
        if let Some(cb) = &self.on_change {
            cb(&self.value, self.version);
        }
        out
    }

    /// 整体替换
    pub fn set(&mut self, value: T) {
        self.update(|v| *v = value);
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// 数组型实体的常用变更操作，每个操作计为一次逻辑修改
impl<U> Versioned<Vec<U>> {
    pub fn push(&mut self, item: U) {
        self.update(|v| v.push(item));
    }

    pub fn pop(&mut self) -> Option<U> {
        self.update(|v| v.pop())
    }

    /// 移除首元素；空数组时同样计为一次写
    pub fn shift(&mut self) -> Option<U> {
        self.update(|v| if v.is_empty() { None } else { Some(v.remove(0)) })
    }

    /// 插入到指定位置，越界时追加到末尾
    pub fn insert(&mut self, index: usize, item: U) {
        self.update(|v| {
            let at = index.min(v.len());
            v.insert(at, item);
        });
    }

    pub fn splice<R, I>(&mut self, range: R, replace_with: I) -> Vec<U>
    where
        R: RangeBounds<usize>,
        I: IntoIterator<Item = U>,
    {
        self.update(|v| v.splice(range, replace_with).collect())
    }

    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&U, &U) -> std::cmp::Ordering,
    {
        self.update(|v| v.sort_by(compare));
    }

    pub fn reverse(&mut self) {
        self.update(|v| v.reverse());
    }
}

impl<T: fmt::Debug> fmt::Debug for Versioned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Versioned")
            .field("value", &self.value)
            .field("version", &self.version)
            .field("tracked", &self.on_change.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone, Default)]
    struct Record {
        name: String,
        tags: Vec<String>,
        nested: Inner,
    }

    #[derive(Debug, Clone, Default)]
    struct Inner {
        count: u32,
    }

    fn counting<T: 'static>() -> (Arc<AtomicU64>, ChangeCallback<T>) {
        let fired = Arc::new(AtomicU64::new(0));
        let f = fired.clone();
        let cb: ChangeCallback<T> = Arc::new(move |_: &T, _: u64| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        (fired, cb)
    }

    #[test]
    fn test_nested_write_notifies_once() {
        let (fired, cb) = counting::<Record>();
        let mut rec = Versioned::with_callback(Record::default(), cb);

        rec.update(|r| {
            r.nested.count += 1;
            r.tags.push("a".into());
            r.name = "bee".into();
        });

        assert_eq!(rec.version(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(rec.get().nested.count, 1);
        assert_eq!(rec.get().name, "bee");
    }

    #[test]
    fn test_callback_sees_new_value_and_version() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = seen.clone();
        let cb: ChangeCallback<String> =
            Arc::new(move |v: &String, ver: u64| s.lock().unwrap().push((v.clone(), ver)));
        let mut rec = Versioned::with_callback(String::new(), cb);
        rec.update(|v| v.push_str("he"));
        rec.update(|v| v.push_str("llo"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("he".to_string(), 1), ("hello".to_string(), 2)]);
    }

    #[test]
    fn test_array_operations_each_bump_version() {
        let (fired, cb) = counting::<Vec<i32>>();
        let mut list = Versioned::with_callback(vec![3, 1, 2], cb);

        list.push(4);
        assert_eq!(list.shift(), Some(3));
        list.insert(0, 9);
        list.insert(100, 7);
        let removed = list.splice(1..3, [5, 6]);
        list.sort_by(|a, b| a.cmp(b));
        list.reverse();
        assert_eq!(list.pop(), Some(4));

        assert_eq!(removed, vec![1, 2]);
        assert_eq!(list.get(), &vec![9, 7, 6, 5]);
        assert_eq!(list.version(), 8);
        assert_eq!(fired.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_untracked_wrapper_still_versions() {
        let mut v = Versioned::new(1);
        v.set(2);
        assert_eq!(*v.get(), 2);
        assert_eq!(v.version(), 1);
        assert_eq!(v.into_inner(), 2);
    }
}
