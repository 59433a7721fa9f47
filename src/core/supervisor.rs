//! 运行监管：取消令牌与活跃运行计数
//!
//! 每次运行从父 token 派生子 token；cancel_all 取消父 token（波及所有在途运行）后换上新的父 token，
//! 之后提交的运行不受影响。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct RunSupervisor {
    /// cancel_all 时触发
    cancel_token: Mutex<CancellationToken>,
    active: Arc<AtomicUsize>,
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: Mutex::new(CancellationToken::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 为单次运行创建子 token，并登记为活跃运行（guard 释放时注销）
    pub fn begin_run(&self) -> (CancellationToken, ActiveRun) {
        let token = self
            .cancel_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token();
        self.active.fetch_add(1, Ordering::SeqCst);
        (
            token,
            ActiveRun {
                active: Arc::clone(&self.active),
            },
        )
    }

    /// 取消所有在途运行；返回被取消时的活跃运行数
    pub fn cancel_all(&self) -> usize {
        let previous = {
            let mut token = self.cancel_token.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *token, CancellationToken::new())
        };
        previous.cancel();
        self.active_runs()
    }

    pub fn active_runs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Default for RunSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// 活跃运行登记，drop 时计数减一
#[derive(Debug)]
pub struct ActiveRun {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
