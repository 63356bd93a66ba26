//-
// Copyright (c) 2024, Mailgather contributors
//
// This file is part of Mailgather.
//
// Mailgather is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailgather is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailgather. If not, see <http://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender};

/// A cancellation flag shared by everything taking part in one run.
///
/// Besides the flag itself, live sockets can be registered so that
/// cancellation also shuts them down, waking any thread blocked reading
/// from them. Threads waiting on something which is not a registered
/// socket can instead select on `notified()`.
///
/// Clones share the same underlying state.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    sockets: Mutex<HashMap<u64, TcpStream>>,
    // Dropped on cancellation, which disconnects `notify_recv`
    notify_send: Mutex<Option<Sender<()>>>,
    notify_recv: Receiver<()>,
}

impl Default for Inner {
    fn default() -> Self {
        let (notify_send, notify_recv) = channel::bounded(0);
        Inner {
            cancelled: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            sockets: Mutex::new(HashMap::new()),
            notify_send: Mutex::new(Some(notify_send)),
            notify_recv,
        }
    }
}

/// Keeps a socket registered with a `CancelToken` until dropped.
pub struct Registration {
    token: CancelToken,
    id: u64,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        log::info!("Cancelling");
        self.inner.notify_send.lock().unwrap().take();
        for socket in self.inner.sockets.lock().unwrap().values() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    /// A receiver which never yields a message, but becomes disconnected
    /// once this token is cancelled.
    pub fn notified(&self) -> &Receiver<()> {
        &self.inner.notify_recv
    }

    /// Arrange for `socket` to be shut down if this token is cancelled.
    ///
    /// If the token has already been cancelled, the socket is shut down
    /// immediately.
    pub fn register(&self, socket: &TcpStream) -> io::Result<Registration> {
        let clone = socket.try_clone()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut sockets = self.inner.sockets.lock().unwrap();
        // Checked under the lock so a concurrent cancel() cannot miss it
        if self.is_cancelled() {
            let _ = clone.shutdown(Shutdown::Both);
        }
        sockets.insert(id, clone);

        Ok(Registration {
            token: self.clone(),
            id,
        })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.token.inner.sockets.lock().unwrap().remove(&self.id);
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn cancel_wakes_blocked_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client =
            TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let token = CancelToken::new();
        let registration = token.register(&client).unwrap();
        assert_eq!(1, token.inner.sockets.lock().unwrap().len());

        crossbeam::scope(|s| {
            let canceller = token.clone();
            s.spawn(move |_| {
                std::thread::sleep(std::time::Duration::from_millis(50));
                canceller.cancel();
            });

            let mut buf = [0u8; 16];
            // Either EOF or an error, depending on platform
            let result = client.read(&mut buf);
            assert!(matches!(result, Ok(0) | Err(_)));
        })
        .unwrap();

        assert!(token.is_cancelled());
        drop(registration);
        assert!(token.inner.sockets.lock().unwrap().is_empty());
    }

    #[test]
    fn cancel_wakes_selecting_thread() {
        let token = CancelToken::new();
        assert_eq!(
            Err(channel::RecvTimeoutError::Timeout),
            token
                .notified()
                .recv_timeout(std::time::Duration::from_millis(10))
        );

        crossbeam::scope(|s| {
            let canceller = token.clone();
            s.spawn(move |_| {
                std::thread::sleep(std::time::Duration::from_millis(50));
                canceller.cancel();
            });

            channel::select! {
                recv(token.notified()) -> r => assert!(r.is_err()),
                default(std::time::Duration::from_secs(10)) => {
                    panic!("cancellation not observed")
                }
            }
        })
        .unwrap();

        // Stays disconnected
        assert!(token.notified().recv().is_err());
    }

    #[test]
    fn registering_after_cancel_shuts_down_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client =
            TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let token = CancelToken::new();
        token.cancel();
        let _registration = token.register(&client).unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }
}
