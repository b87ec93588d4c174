//! End-to-end tests against a local stub HTTP server.

use std::{
    collections::HashMap,
    io::{Read, Write},
    sync::{Arc, Mutex},
};

use streampipe::{
    hls::HlsStream,
    session::{http::HttpSession, options::Options},
    stream::Stream,
};

struct StubServer {
    base: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl StubServer {
    /// Serve a fixed route table, one connection per request.
    fn start(routes: HashMap<String, Vec<u8>>) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let thread_hits = hits.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            request.extend_from_slice(&buf[..n]);
                            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                let head = String::from_utf8_lossy(&request);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                *thread_hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;
                match routes.get(&path) {
                    Some(body) => {
                        let _ = write!(
                            stream,
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        );
                        let _ = stream.write_all(body);
                    }
                    None => {
                        let _ = write!(
                            stream,
                            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        );
                    }
                }
            }
        });
        Self {
            base: format!("http://{addr}"),
            hits,
        }
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

fn open_hls(server: &StubServer, path: &str) -> Box<dyn streampipe::stream::StreamHandle> {
    let http = Arc::new(HttpSession::new().unwrap());
    let options = Arc::new(Options::new());
    let stream = HlsStream::new(http, options, format!("{}{path}", server.base));
    stream.open().unwrap()
}

#[test]
fn static_hls_vod_yields_segments_in_order() {
    let segments: [&[u8]; 4] = [b"first-segment", b"2nd", b"third-part-of-it", b"tail"];
    let playlist = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:10.0,
/s0.ts
#EXTINF:10.0,
/s1.ts
#EXTINF:10.0,
/s2.ts
#EXTINF:10.0,
/s3.ts
#EXT-X-ENDLIST
";
    let mut routes = HashMap::new();
    routes.insert("/play.m3u8".to_string(), playlist.as_bytes().to_vec());
    for (i, body) in segments.iter().enumerate() {
        routes.insert(format!("/s{i}.ts"), body.to_vec());
    }
    let server = StubServer::start(routes);

    let mut handle = open_hls(&server, "/play.m3u8");
    let mut output = Vec::new();
    handle.read_to_end(&mut output).unwrap();
    handle.close();

    let expected: Vec<u8> = segments.concat();
    assert_eq!(output, expected);
    for i in 0..4 {
        assert_eq!(server.hits(&format!("/s{i}.ts")), 1);
    }
}

#[test]
fn aes_128_segments_are_decrypted_with_one_key_fetch() {
    use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    let key = [0x42u8; 16];
    let plains: [&[u8]; 3] = [b"plain segment zero", b"segment one", b"and the last one"];
    let encrypt = |plain: &[u8], num: u64| -> Vec<u8> {
        let mut iv = [0u8; 16];
        iv[8..].copy_from_slice(&num.to_be_bytes());
        let mut buf = vec![0u8; plain.len() + 16];
        buf[..plain.len()].copy_from_slice(plain);
        Aes128CbcEnc::new(&key.into(), &iv.into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len())
            .unwrap()
            .to_vec()
    };

    let playlist = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"
#EXTINF:10.0,
/e0.ts
#EXTINF:10.0,
/e1.ts
#EXTINF:10.0,
/e2.ts
#EXT-X-ENDLIST
";
    let mut routes = HashMap::new();
    routes.insert("/play.m3u8".to_string(), playlist.as_bytes().to_vec());
    routes.insert("/key.bin".to_string(), key.to_vec());
    for (i, plain) in plains.iter().enumerate() {
        routes.insert(format!("/e{i}.ts"), encrypt(plain, i as u64));
    }
    let server = StubServer::start(routes);

    let mut handle = open_hls(&server, "/play.m3u8");
    let mut output = Vec::new();
    handle.read_to_end(&mut output).unwrap();
    handle.close();

    assert_eq!(output, plains.concat());
    assert_eq!(server.hits("/key.bin"), 1);
}

#[test]
fn master_playlists_are_rejected() {
    let master = "\
#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720
/variant.m3u8
";
    let mut routes = HashMap::new();
    routes.insert("/master.m3u8".to_string(), master.as_bytes().to_vec());
    let server = StubServer::start(routes);

    let http = Arc::new(HttpSession::new().unwrap());
    let options = Arc::new(Options::new());
    let stream = HlsStream::new(http, options, format!("{}/master.m3u8", server.base));
    assert!(stream.open().is_err());
}
