//! Stream socket channels.
//!
//! `ServerSocketChannel` accepts connections; `SocketChannel` is one
//! endpoint of a stream. Both follow the shared channel discipline: every
//! potentially-blocking syscall is bracketed by the core's `begin`/`end`
//! guard, and non-blocking registration with a selector drives readiness.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::channel::{finish_io, ChannelCore, SelectableChannel, POLLNVAL};
use crate::error::{MuxError, Result};
use crate::event::Ops;
use crate::key::SelectionKey;
use crate::poll::{POLLERR, POLLHUP, POLLIN, POLLOUT};
use crate::utils::cvt;

fn new_stream_socket() -> io::Result<libc::c_int> {
    cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) })
}

/// Encode a socket address for the kernel.
fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn local_addr_of(fd: libc::c_int) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    })?;
    sockaddr_to_addr(&storage)
}

fn remote_addr_of(fd: libc::c_int) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe {
        libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    })?;
    sockaddr_to_addr(&storage)
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::from((ip, u16::from_be(sin6.sin6_port))))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

/// Listening stream socket.
pub struct ServerSocketChannel {
    core: ChannelCore,
    local: Mutex<Option<SocketAddr>>,
}

impl ServerSocketChannel {
    pub fn open() -> Result<Arc<ServerSocketChannel>> {
        let fd = new_stream_socket()?;
        Ok(Arc::new(ServerSocketChannel {
            core: ChannelCore::new_uninitialized(fd),
            local: Mutex::new(None),
        }))
    }

    /// Bind and start listening. `backlog` of 0 uses a default of 128.
    pub fn bind(&self, addr: SocketAddr, backlog: i32) -> Result<()> {
        if !self.core.is_open() {
            return Err(MuxError::ClosedChannel);
        }
        let fd = self.core.fd();
        let reuse: libc::c_int = 1;
        cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &reuse as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
        let (storage, len) = sockaddr_from(&addr);
        cvt(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
        cvt(unsafe { libc::listen(fd, if backlog > 0 { backlog } else { 128 }) })?;
        *self.local.lock().unwrap() = Some(local_addr_of(fd)?);
        self.core.mark_in_use();
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock().unwrap()
    }

    /// Accept one connection. Returns `Ok(None)` when non-blocking and no
    /// connection is pending. The accepted channel starts in blocking mode.
    pub fn accept(self: &Arc<Self>) -> Result<Option<Arc<SocketChannel>>> {
        if !self.core.is_open() {
            return Err(MuxError::ClosedChannel);
        }
        let channel: Arc<dyn SelectableChannel> = self.clone();
        let core = &self.core;
        core.begin(&channel);
        core.enter_io();
        let result = loop {
            let n = unsafe {
                libc::accept4(
                    core.fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_CLOEXEC,
                )
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) && core.is_open() {
                    continue;
                }
                break Err(err);
            }
            break Ok(n);
        };
        core.leave_io();
        let completed = result.is_ok();
        core.end(completed)?;
        match result {
            Ok(fd) => {
                let remote = remote_addr_of(fd).ok();
                Ok(Some(Arc::new(SocketChannel {
                    core: ChannelCore::new(fd),
                    conn: Mutex::new(ConnState::Connected),
                    remote: Mutex::new(remote),
                })))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(MuxError::Io(e)),
        }
    }
}

impl SelectableChannel for ServerSocketChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn valid_ops(&self) -> Ops {
        Ops::ACCEPT
    }

    fn impl_close_selectable(&self) -> io::Result<()> {
        if self.core.io_in_flight() {
            // Unblock a thread parked in accept.
            unsafe { libc::shutdown(self.core.fd(), libc::SHUT_RDWR) };
        }
        if !self.core.is_registered() {
            self.core.kill()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Unconnected,
    Pending,
    Connected,
}

/// One endpoint of a stream connection.
pub struct SocketChannel {
    core: ChannelCore,
    conn: Mutex<ConnState>,
    remote: Mutex<Option<SocketAddr>>,
}

impl SocketChannel {
    pub fn open() -> Result<Arc<SocketChannel>> {
        let fd = new_stream_socket()?;
        Ok(Arc::new(SocketChannel {
            core: ChannelCore::new(fd),
            conn: Mutex::new(ConnState::Unconnected),
            remote: Mutex::new(None),
        }))
    }

    pub fn is_connected(&self) -> bool {
        *self.conn.lock().unwrap() == ConnState::Connected
    }

    pub fn is_connection_pending(&self) -> bool {
        *self.conn.lock().unwrap() == ConnState::Pending
    }

    /// Connect to `addr`. In blocking mode this completes (or fails) before
    /// returning; in non-blocking mode it returns `false` and the
    /// connection is finished later via [`finish_connect`], typically after
    /// the selector reports `CONNECT` readiness.
    ///
    /// [`finish_connect`]: SocketChannel::finish_connect
    pub fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<bool> {
        {
            let conn = self.conn.lock().unwrap();
            match *conn {
                ConnState::Connected => {
                    return Err(MuxError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "socket already connected",
                    )))
                }
                ConnState::Pending => {
                    return Err(MuxError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "connection already in progress",
                    )))
                }
                ConnState::Unconnected => {}
            }
        }
        if !self.core.is_open() {
            return Err(MuxError::ClosedChannel);
        }

        let channel: Arc<dyn SelectableChannel> = self.clone();
        let core = &self.core;
        let (storage, len) = sockaddr_from(&addr);
        core.begin(&channel);
        core.enter_io();
        let result = loop {
            let n = unsafe {
                libc::connect(core.fd(), &storage as *const _ as *const libc::sockaddr, len)
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) && core.is_open() {
                    continue;
                }
                break Err(err);
            }
            break Ok(());
        };
        core.leave_io();
        let completed = match &result {
            Ok(()) => true,
            Err(e) => e.raw_os_error() == Some(libc::EINPROGRESS),
        };
        core.end(completed)?;
        match result {
            Ok(()) => {
                *self.conn.lock().unwrap() = ConnState::Connected;
                *self.remote.lock().unwrap() = Some(addr);
                Ok(true)
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                *self.conn.lock().unwrap() = ConnState::Pending;
                *self.remote.lock().unwrap() = Some(addr);
                Ok(false)
            }
            Err(e) => Err(MuxError::Io(e)),
        }
    }

    /// Complete a non-blocking connect. Returns `false` while the
    /// connection is still in progress.
    pub fn finish_connect(&self) -> Result<bool> {
        match *self.conn.lock().unwrap() {
            ConnState::Connected => return Ok(true),
            ConnState::Unconnected => {
                return Err(MuxError::Io(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no connection in progress",
                )))
            }
            ConnState::Pending => {}
        }
        let fd = self.core.fd();
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        cvt(unsafe { libc::poll(&mut pfd, 1, 0) })?;
        if pfd.revents == 0 {
            return Ok(false);
        }
        let mut so_error: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut _ as *mut libc::c_void,
                &mut len,
            )
        })?;
        if so_error != 0 {
            return Err(MuxError::Io(io::Error::from_raw_os_error(so_error)));
        }
        *self.conn.lock().unwrap() = ConnState::Connected;
        Ok(true)
    }

    pub fn read(self: &Arc<Self>, buf: &mut [u8]) -> Result<usize> {
        if !self.core.is_open() {
            return Err(MuxError::ClosedChannel);
        }
        let channel: Arc<dyn SelectableChannel> = self.clone();
        let core = &self.core;
        core.begin(&channel);
        core.enter_io();
        let result = loop {
            let n = unsafe {
                libc::read(core.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) && core.is_open() {
                    continue;
                }
                break Err(err);
            }
            break Ok(n);
        };
        core.leave_io();
        finish_io(core, result).map(|n| n as usize)
    }

    pub fn write(self: &Arc<Self>, buf: &[u8]) -> Result<usize> {
        if !self.core.is_open() {
            return Err(MuxError::ClosedChannel);
        }
        let channel: Arc<dyn SelectableChannel> = self.clone();
        let core = &self.core;
        core.begin(&channel);
        core.enter_io();
        let result = loop {
            let n = unsafe {
                libc::write(core.fd(), buf.as_ptr() as *const libc::c_void, buf.len())
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) && core.is_open() {
                    continue;
                }
                break Err(err);
            }
            break Ok(n);
        };
        core.leave_io();
        finish_io(core, result).map(|n| n as usize)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(local_addr_of(self.core.fd())?)
    }

    /// Address this socket is connected (or connecting) to.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock().unwrap()
    }

    /// Half-close the read direction; subsequent reads see end-of-stream.
    pub fn shutdown_input(&self) -> Result<()> {
        if !self.core.is_open() {
            return Err(MuxError::ClosedChannel);
        }
        cvt(unsafe { libc::shutdown(self.core.fd(), libc::SHUT_RD) })?;
        Ok(())
    }

    /// Half-close the write direction; the peer's reads see end-of-stream.
    pub fn shutdown_output(&self) -> Result<()> {
        if !self.core.is_open() {
            return Err(MuxError::ClosedChannel);
        }
        cvt(unsafe { libc::shutdown(self.core.fd(), libc::SHUT_WR) })?;
        Ok(())
    }
}

impl SelectableChannel for SocketChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn valid_ops(&self) -> Ops {
        Ops::READ | Ops::WRITE | Ops::CONNECT
    }

    fn impl_close_selectable(&self) -> io::Result<()> {
        if self.core.io_in_flight() {
            unsafe { libc::shutdown(self.core.fd(), libc::SHUT_RDWR) };
        }
        if !self.core.is_registered() {
            self.core.kill()?;
        }
        Ok(())
    }

    /// Like the default table, but READ/WRITE only count once connected and
    /// POLLOUT reports CONNECT while a connection is pending.
    fn translate_ready(&self, kernel: u32, initial: Ops, key: &SelectionKey) -> bool {
        if kernel & POLLNVAL != 0 {
            return false;
        }
        let interest = key.interest();
        if kernel & (POLLERR | POLLHUP) != 0 {
            key.set_ready(interest);
            return !interest.difference(initial).is_empty();
        }
        let conn = *self.conn.lock().unwrap();
        let mut new_ops = Ops::empty();
        if kernel & POLLIN != 0 && interest.contains(Ops::READ) && conn == ConnState::Connected {
            new_ops = new_ops | Ops::READ;
        }
        if kernel & POLLOUT != 0 {
            if interest.contains(Ops::WRITE) && conn == ConnState::Connected {
                new_ops = new_ops | Ops::WRITE;
            }
            if interest.contains(Ops::CONNECT) && conn == ConnState::Pending {
                new_ops = new_ops | Ops::CONNECT;
            }
        }
        key.set_ready(initial | new_ops);
        !new_ops.difference(initial).is_empty()
    }
}
