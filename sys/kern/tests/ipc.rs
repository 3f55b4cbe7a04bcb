// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end exercises of the synchronous IPC state machine, driven
//! through the syscall layer the way user code would drive it.

mod common;

use abi::{Error, IoVec, MsgId, Sysnum, PULSE_TYPE_IRQ};
use common::{boot, noop, Sim};
use kern::ipc;
use kern::process;
use kern::syscalls::SyscallDisposition;
use kern::thread::SchedState;

fn iov(buf: &[u8]) -> IoVec {
    IoVec {
        base: buf.as_ptr() as usize,
        len: buf.len(),
    }
}

/// Establishes the usual client/server pair: server owns a channel, client
/// holds a connection to it. Returns (server thread, client thread, chid,
/// coid).
fn wire(sim: &Sim) -> (kern::thread::ThreadRef, kern::thread::ThreadRef, i32, i32) {
    let (spid, s) = sim.spawn("server", None);
    let (_cpid, c) = sim.spawn("client", None);
    let chid = match sim.sys(s, Sysnum::ChannelCreate, [0; 5]) {
        SyscallDisposition::Resume => sim.ret(s) as i32,
        d => panic!("channel_create: {:?}", d),
    };
    assert!(chid > 0);
    let coid = match sim.sys(
        c,
        Sysnum::Connect,
        [spid.0 as usize, chid as usize, 0, 0, 0],
    ) {
        SyscallDisposition::Resume => sim.ret(c) as i32,
        d => panic!("connect: {:?}", d),
    };
    assert!(coid > 0);
    (s, c, chid, coid)
}

#[test]
fn receiver_arrives_first() {
    let sim = boot();
    let (s, c, chid, coid) = wire(&sim);

    let mut rbuf = [0u8; 16];
    let mut msgid: MsgId = 0;
    let d = sim.sys(
        s,
        Sysnum::MsgReceive,
        [
            chid as usize,
            &mut msgid as *mut MsgId as usize,
            rbuf.as_mut_ptr() as usize,
            rbuf.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::CallerBlocked(_)));
    assert!(matches!(sim.state_of(s), SchedState::InRecv(_)));

    let req = *b"ping";
    let mut reply = [0u8; 8];
    let d = sim.sys(
        c,
        Sysnum::MsgSend,
        [
            coid as usize,
            req.as_ptr() as usize,
            req.len(),
            reply.as_mut_ptr() as usize,
            reply.len(),
        ],
    );
    assert!(matches!(d, SyscallDisposition::CallerBlocked(_)));

    // The server unblocked with exactly the four bytes and a usable id;
    // the client parked itself awaiting the reply.
    assert_eq!(sim.state_of(s), SchedState::Ready);
    assert_eq!(sim.ret(s), 4);
    assert!(msgid > 0);
    assert_eq!(&rbuf[..4], b"ping");
    assert!(matches!(sim.state_of(c), SchedState::InReply(_)));

    // Reply flows back into the client's reply buffer.
    let pong = *b"pong!";
    let d = sim.sys(
        s,
        Sysnum::MsgReply,
        [
            msgid as usize,
            Error::Ok as u32 as usize,
            pong.as_ptr() as usize,
            pong.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(s), 5);
    assert_eq!(sim.state_of(c), SchedState::Ready);
    assert_eq!(sim.ret(c), 5);
    assert_eq!(&reply[..5], b"pong!");
}

#[test]
fn echo_fragmented_send() {
    let sim = boot();
    let (s, c, chid, coid) = wire(&sim);

    // Server posts a vectored receive of three two-byte fragments.
    let mut r0 = [0u8; 2];
    let mut r1 = [0u8; 2];
    let mut r2 = [0u8; 2];
    let riov = [iov(&r0), iov(&r1), iov(&r2)];
    let mut msgid: MsgId = 0;
    let d = sim.sys(
        s,
        Sysnum::MsgReceiveV,
        [
            chid as usize,
            &mut msgid as *mut MsgId as usize,
            riov.as_ptr() as usize,
            riov.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::CallerBlocked(_)));

    // Client sends "Artoo\0" split 1/3/2, expecting the echo across three
    // two-byte reply fragments.
    let req = *b"Artoo\0";
    let siov = [
        IoVec {
            base: req.as_ptr() as usize,
            len: 1,
        },
        IoVec {
            base: req.as_ptr() as usize + 1,
            len: 3,
        },
        IoVec {
            base: req.as_ptr() as usize + 4,
            len: 2,
        },
    ];
    let mut e0 = [0u8; 2];
    let mut e1 = [0u8; 2];
    let mut e2 = [0u8; 2];
    let eiov = [iov(&e0), iov(&e1), iov(&e2)];
    let d = sim.sys(
        c,
        Sysnum::MsgSendV,
        [
            coid as usize,
            siov.as_ptr() as usize,
            siov.len(),
            eiov.as_ptr() as usize,
            eiov.len(),
        ],
    );
    assert!(matches!(d, SyscallDisposition::CallerBlocked(_)));

    assert_eq!(sim.ret(s), 6);
    assert_eq!(&r0, b"Ar");
    assert_eq!(&r1, b"to");
    assert_eq!(&r2, b"o\0");

    // Server echoes its three fragments straight back.
    let reply_iov = [iov(&r0), iov(&r1), iov(&r2)];
    let d = sim.sys(
        s,
        Sysnum::MsgReplyV,
        [
            msgid as usize,
            Error::Ok as u32 as usize,
            reply_iov.as_ptr() as usize,
            reply_iov.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(c), 6);
    assert_eq!(&e0, b"Ar");
    assert_eq!(&e1, b"to");
    assert_eq!(&e2, b"o\0");
}

#[test]
fn sender_arrives_first_and_truncates() {
    let sim = boot();
    let (s, c, chid, coid) = wire(&sim);

    let req = *b"sixbyt";
    let mut reply = [0u8; 4];
    let d = sim.sys(
        c,
        Sysnum::MsgSend,
        [
            coid as usize,
            req.as_ptr() as usize,
            req.len(),
            reply.as_mut_ptr() as usize,
            reply.len(),
        ],
    );
    assert!(matches!(d, SyscallDisposition::CallerBlocked(_)));
    assert!(matches!(sim.state_of(c), SchedState::InSend(_)));

    // Undersized receive buffer: the copy is bounded and the written count
    // is what the server sees.
    let mut rbuf = [0u8; 4];
    let mut msgid: MsgId = 0;
    let d = sim.sys(
        s,
        Sysnum::MsgReceive,
        [
            chid as usize,
            &mut msgid as *mut MsgId as usize,
            rbuf.as_mut_ptr() as usize,
            rbuf.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(s), 4);
    assert_eq!(&rbuf, b"sixb");
    assert!(matches!(sim.state_of(c), SchedState::InReply(_)));

    // Excess reply bytes also truncate, to the client's 4-byte buffer.
    let big = *b"longreply";
    let d = sim.sys(
        s,
        Sysnum::MsgReply,
        [
            msgid as usize,
            Error::Ok as u32 as usize,
            big.as_ptr() as usize,
            big.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(s), 4);
    assert_eq!(sim.ret(c), 4);
    assert_eq!(&reply, b"long");
}

#[test]
fn server_dies_holding_a_message() {
    let sim = boot();
    let (s, c, chid, coid) = wire(&sim);
    let spid = sim.with_state(|ks| ks.pid_of(s).unwrap());

    let req = *b"hail";
    let mut reply = [0u8; 4];
    let d = sim.sys(
        c,
        Sysnum::MsgSend,
        [
            coid as usize,
            req.as_ptr() as usize,
            req.len(),
            reply.as_mut_ptr() as usize,
            reply.len(),
        ],
    );
    assert!(matches!(d, SyscallDisposition::CallerBlocked(_)));

    let mut rbuf = [0u8; 8];
    let mut msgid: MsgId = 0;
    let d = sim.sys(
        s,
        Sysnum::MsgReceive,
        [
            chid as usize,
            &mut msgid as *mut MsgId as usize,
            rbuf.as_mut_ptr() as usize,
            rbuf.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert!(matches!(sim.state_of(c), SchedState::InReply(_)));

    // Server exits without replying; the client's send completes with
    // NO_SYS.
    sim.with_state(|ks| process::terminate(ks, spid));
    assert_eq!(sim.state_of(c), SchedState::Ready);
    assert_eq!(sim.ret(c), Error::NoSys.as_return());
}

#[test]
fn pulses_preempt_synchronous_messages() {
    let sim = boot();
    let (s, c, chid, coid) = wire(&sim);
    let cpid = sim.with_state(|ks| ks.pid_of(c).unwrap());

    // A synchronous message is already waiting...
    let req = *b"sync";
    let mut reply = [0u8; 4];
    let d = sim.sys(
        c,
        Sysnum::MsgSend,
        [
            coid as usize,
            req.as_ptr() as usize,
            req.len(),
            reply.as_mut_ptr() as usize,
            reply.len(),
        ],
    );
    assert!(matches!(d, SyscallDisposition::CallerBlocked(_)));

    // ...when two pulses arrive.
    sim.with_state(|ks| {
        ipc::send_pulse(ks, cpid, coid, PULSE_TYPE_IRQ, 7).unwrap();
        ipc::send_pulse(ks, cpid, coid, PULSE_TYPE_IRQ, 8).unwrap();
    });

    // The receiver sees both pulses, in order, before the message.
    for expect in [7, 8] {
        let mut rbuf = [0u8; 8];
        let mut msgid: MsgId = -1;
        let d = sim.sys(
            s,
            Sysnum::MsgReceive,
            [
                chid as usize,
                &mut msgid as *mut MsgId as usize,
                rbuf.as_mut_ptr() as usize,
                rbuf.len(),
                0,
            ],
        );
        assert!(matches!(d, SyscallDisposition::Resume));
        assert_eq!(sim.ret(s), abi::Pulse::WIRE_LEN as isize);
        assert_eq!(msgid, 0, "a pulse has no message context");
        let p = abi::Pulse::decode(&rbuf).unwrap();
        assert_eq!(p.ptype, PULSE_TYPE_IRQ);
        assert_eq!(p.value, expect);
    }

    let mut rbuf = [0u8; 8];
    let mut msgid: MsgId = 0;
    let d = sim.sys(
        s,
        Sysnum::MsgReceive,
        [
            chid as usize,
            &mut msgid as *mut MsgId as usize,
            rbuf.as_mut_ptr() as usize,
            rbuf.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(s), 4);
    assert!(msgid > 0);
    assert_eq!(&rbuf[..4], b"sync");
}

#[test]
fn pulse_queue_is_bounded() {
    let sim = boot();
    let (_s, c, _chid, coid) = wire(&sim);
    let cpid = sim.with_state(|ks| ks.pid_of(c).unwrap());

    sim.with_state(|ks| {
        for i in 0..ipc::PULSE_QUEUE_DEPTH {
            ipc::send_pulse(ks, cpid, coid, PULSE_TYPE_IRQ, i as i32)
                .unwrap();
        }
        // One past the cap is dropped, not queued and not blocked on.
        let err = ipc::send_pulse(ks, cpid, coid, PULSE_TYPE_IRQ, 999);
        assert_eq!(err, Err(Error::NoMem));
    });
}

#[test]
fn channel_destroy_completes_queued_senders() {
    let sim = boot();
    let (s, c, chid, coid) = wire(&sim);

    let req = *b"doom";
    let mut reply = [0u8; 4];
    let d = sim.sys(
        c,
        Sysnum::MsgSend,
        [
            coid as usize,
            req.as_ptr() as usize,
            req.len(),
            reply.as_mut_ptr() as usize,
            reply.len(),
        ],
    );
    assert!(matches!(d, SyscallDisposition::CallerBlocked(_)));

    let d = sim.sys(s, Sysnum::ChannelDestroy, [chid as usize, 0, 0, 0, 0]);
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(s), 0);

    assert_eq!(sim.state_of(c), SchedState::Ready);
    assert_eq!(sim.ret(c), Error::NoSys.as_return());

    // The surviving connection points at a husk; new sends bounce.
    let d = sim.sys(
        c,
        Sysnum::MsgSend,
        [
            coid as usize,
            req.as_ptr() as usize,
            req.len(),
            reply.as_mut_ptr() as usize,
            reply.len(),
        ],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(c), Error::NoSys.as_return());
}

#[test]
fn channel_destroy_wakes_blocked_receiver() {
    let sim = boot();
    let (spid, s1) = sim.spawn("server", None);
    let s2 = sim.with_state(|ks| {
        process::add_thread(ks, spid, abi::Priority::Normal, noop, 0).unwrap()
    });

    let chid = match sim.sys(s1, Sysnum::ChannelCreate, [0; 5]) {
        SyscallDisposition::Resume => sim.ret(s1) as i32,
        d => panic!("channel_create: {:?}", d),
    };

    let mut rbuf = [0u8; 8];
    let mut msgid: MsgId = 0;
    let d = sim.sys(
        s1,
        Sysnum::MsgReceive,
        [
            chid as usize,
            &mut msgid as *mut MsgId as usize,
            rbuf.as_mut_ptr() as usize,
            rbuf.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::CallerBlocked(_)));

    let d = sim.sys(s2, Sysnum::ChannelDestroy, [chid as usize, 0, 0, 0, 0]);
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.state_of(s1), SchedState::Ready);
    assert_eq!(sim.ret(s1), Error::NoSys.as_return());
}

#[test]
fn disconnect_cancels_this_connections_queued_sends() {
    let sim = boot();
    let (spid, _s) = sim.spawn("server", None);
    let (cpid, c1) = sim.spawn("client", None);
    let c2 = sim.with_state(|ks| {
        process::add_thread(ks, cpid, abi::Priority::Normal, noop, 0).unwrap()
    });

    let (chid, coid) = sim.with_state(|ks| {
        let chid = ipc::channel_create(ks, spid).unwrap();
        let coid = ipc::connect(ks, cpid, spid, chid).unwrap();
        (chid, coid)
    });
    let _ = chid;

    let req = *b"bye";
    let mut reply = [0u8; 4];
    let d = sim.sys(
        c1,
        Sysnum::MsgSend,
        [
            coid as usize,
            req.as_ptr() as usize,
            req.len(),
            reply.as_mut_ptr() as usize,
            reply.len(),
        ],
    );
    assert!(matches!(d, SyscallDisposition::CallerBlocked(_)));

    let d = sim.sys(c2, Sysnum::Disconnect, [coid as usize, 0, 0, 0, 0]);
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(c2), 0);

    assert_eq!(sim.state_of(c1), SchedState::Ready);
    assert_eq!(sim.ret(c1), Error::NoSys.as_return());
}

#[test]
fn reply_to_unknown_msgid_is_invalid() {
    let sim = boot();
    let (s, _c, _chid, _coid) = wire(&sim);

    let d = sim.sys(
        s,
        Sysnum::MsgReply,
        [41, Error::Ok as u32 as usize, 0, 0, 0],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(s), Error::Invalid.as_return());
}

#[test]
fn msgread_and_getlen_window_into_the_request() {
    let sim = boot();
    let (s, c, chid, coid) = wire(&sim);

    let req = *b"abcdefgh";
    let mut reply = [0u8; 1];
    let d = sim.sys(
        c,
        Sysnum::MsgSend,
        [
            coid as usize,
            req.as_ptr() as usize,
            req.len(),
            reply.as_mut_ptr() as usize,
            reply.len(),
        ],
    );
    assert!(matches!(d, SyscallDisposition::CallerBlocked(_)));

    // Receive only a prefix; the rest stays readable through msgread.
    let mut rbuf = [0u8; 2];
    let mut msgid: MsgId = 0;
    let d = sim.sys(
        s,
        Sysnum::MsgReceive,
        [
            chid as usize,
            &mut msgid as *mut MsgId as usize,
            rbuf.as_mut_ptr() as usize,
            rbuf.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(s), 2);

    let d = sim.sys(s, Sysnum::MsgGetLen, [msgid as usize, 0, 0, 0, 0]);
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(s), 8);

    let mut window = [0u8; 3];
    let d = sim.sys(
        s,
        Sysnum::MsgRead,
        [
            msgid as usize,
            4,
            window.as_mut_ptr() as usize,
            window.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(s), 3);
    assert_eq!(&window, b"efg");

    // Reading past the end yields nothing.
    let d = sim.sys(
        s,
        Sysnum::MsgRead,
        [
            msgid as usize,
            100,
            window.as_mut_ptr() as usize,
            window.len(),
            0,
        ],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(s), 0);
}

#[test]
fn send_on_unknown_connection_is_invalid() {
    let sim = boot();
    let (_spid, _s) = sim.spawn("server", None);
    let (_cpid, c) = sim.spawn("client", None);

    let req = [0u8; 1];
    let d = sim.sys(
        c,
        Sysnum::MsgSend,
        [99, req.as_ptr() as usize, req.len(), 0, 0],
    );
    assert!(matches!(d, SyscallDisposition::Resume));
    assert_eq!(sim.ret(c), Error::Invalid.as_return());
}

#[test]
fn channel_queue_exclusivity_holds_through_traffic() {
    let sim = boot();
    let (s, c, chid, coid) = wire(&sim);

    let check = |sim: &Sim| {
        sim.with_state(|ks| {
            for (_, ch) in ks.channels.iter() {
                assert!(
                    ch.send_queue.is_empty() || ch.recv_queue.is_empty(),
                    "both channel queues non-empty"
                );
            }
        })
    };

    check(&sim);
    let req = *b"x";
    let mut reply = [0u8; 1];
    let _ = sim.sys(
        c,
        Sysnum::MsgSend,
        [
            coid as usize,
            req.as_ptr() as usize,
            1,
            reply.as_mut_ptr() as usize,
            1,
        ],
    );
    check(&sim);

    let mut rbuf = [0u8; 1];
    let mut msgid: MsgId = 0;
    let _ = sim.sys(
        s,
        Sysnum::MsgReceive,
        [
            chid as usize,
            &mut msgid as *mut MsgId as usize,
            rbuf.as_mut_ptr() as usize,
            1,
            0,
        ],
    );
    check(&sim);

    let _ = sim.sys(
        s,
        Sysnum::MsgReceive,
        [
            chid as usize,
            &mut msgid as *mut MsgId as usize,
            rbuf.as_mut_ptr() as usize,
            1,
            0,
        ],
    );
    check(&sim);
}
