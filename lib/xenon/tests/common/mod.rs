//! A minimal in-process XRootD server: answers the initial handshake, the
//! protocol and login exchanges, and echoes an OK response to every ping.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

const PROTOCOL_VERSION: u32 = 0x0000_0300;
const DATA_SERVER: u32 = 1;
const IS_SERVER: u32 = 1;

/// Bind an ephemeral port and serve connections on a background thread for
/// the lifetime of the test process. Returns the port.
pub fn start_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(socket) => {
                    thread::spawn(move || {
                        let _ = serve(socket);
                    });
                }
                Err(_) => break,
            }
        }
    });

    port
}

fn serve(mut socket: TcpStream) -> std::io::Result<()> {
    handle_login(&mut socket)?;

    // Request loop: 24-byte headers, bodies skipped, pings echoed.
    loop {
        let mut request = [0u8; 24];
        socket.read_exact(&mut request)?;

        let dlen = u32::from_be_bytes([request[20], request[21], request[22], request[23]]);
        if dlen > 0 {
            let mut body = vec![0u8; dlen as usize];
            socket.read_exact(&mut body)?;
        }

        let mut response = [0u8; 8];
        response[0] = request[0];
        response[1] = request[1];
        socket.write_all(&response)?;
    }
}

fn handle_login(socket: &mut TcpStream) -> std::io::Result<()> {
    // Client handshake in, server handshake out.
    let mut handshake = [0u8; 20];
    socket.read_exact(&mut handshake)?;

    let mut server_handshake = [0u8; 16];
    server_handshake[4..8].copy_from_slice(&8u32.to_be_bytes());
    server_handshake[8..12].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    server_handshake[12..16].copy_from_slice(&DATA_SERVER.to_be_bytes());
    socket.write_all(&server_handshake)?;

    // kXR_protocol.
    let mut request = [0u8; 24];
    socket.read_exact(&mut request)?;

    let mut protocol_response = [0u8; 16];
    protocol_response[4..8].copy_from_slice(&8u32.to_be_bytes());
    protocol_response[8..12].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    protocol_response[12..16].copy_from_slice(&IS_SERVER.to_be_bytes());
    socket.write_all(&protocol_response)?;

    // kXR_login; the response body is the 16-byte session id, no security
    // token, so the client skips authentication.
    socket.read_exact(&mut request)?;

    let mut login_response = [0u8; 24];
    login_response[4..8].copy_from_slice(&16u32.to_be_bytes());
    login_response[8] = 0xab;
    socket.write_all(&login_response)?;

    Ok(())
}
