//! Browser ClientHello and HTTP/2 SETTINGS shapes, keyed by profile.

use veil_traits::ProfileId;

/// Ceiling applied to response header lists, HTTP/1.1 heads included.
pub const MAX_HEADER_LIST_SIZE: u32 = 262_144;

/// ALPN offer in wire format: h2, then http/1.1.
pub const ALPN_H2_HTTP11: &[u8] = b"\x02h2\x08http/1.1";

const CHROME_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:\
ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305:\
ECDHE-RSA-AES128-SHA:ECDHE-RSA-AES256-SHA:\
AES128-GCM-SHA256:AES256-GCM-SHA384:AES128-SHA:AES256-SHA";

const FIREFOX_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305:\
ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:\
ECDHE-ECDSA-AES256-SHA:ECDHE-ECDSA-AES128-SHA:\
ECDHE-RSA-AES128-SHA:ECDHE-RSA-AES256-SHA:\
AES128-GCM-SHA256:AES256-GCM-SHA384:AES128-SHA:AES256-SHA";

// Apple prefers the ECDSA AES-256 suites first.
const SAFARI_CIPHERS: &str = "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:\
ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-AES256-GCM-SHA384:\
ECDHE-RSA-AES128-GCM-SHA256:ECDHE-RSA-CHACHA20-POLY1305:\
ECDHE-ECDSA-AES256-SHA:ECDHE-ECDSA-AES128-SHA:\
ECDHE-RSA-AES256-SHA:ECDHE-RSA-AES128-SHA:\
AES256-GCM-SHA384:AES128-GCM-SHA256:AES256-SHA:AES128-SHA";

const CHROME_SIGALGS: &str = "ECDSA+SHA256:RSA-PSS+SHA256:RSA+SHA256:\
ECDSA+SHA384:RSA-PSS+SHA384:RSA+SHA384:RSA-PSS+SHA512:RSA+SHA512";

const FIREFOX_SIGALGS: &str = "ECDSA+SHA256:ECDSA+SHA384:ECDSA+SHA512:\
RSA-PSS+SHA256:RSA-PSS+SHA384:RSA-PSS+SHA512:RSA+SHA256:RSA+SHA384:RSA+SHA512:\
ECDSA+SHA1:RSA+SHA1";

const SAFARI_SIGALGS: &str = "ECDSA+SHA256:RSA-PSS+SHA256:RSA+SHA256:\
ECDSA+SHA384:ECDSA+SHA1:RSA-PSS+SHA384:RSA+SHA384:\
RSA-PSS+SHA512:RSA+SHA512:RSA+SHA1";

/// HTTP/2 SETTINGS a browser sends in its connection preface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub initial_connection_window_size: u32,
    pub max_frame_size: u32,
}

/// Everything that shapes one browser's handshake.
#[derive(Debug, Clone, Copy)]
pub struct BrowserFingerprint {
    pub cipher_list: &'static str,
    pub curves: &'static str,
    pub sigalgs: &'static str,
    pub grease: bool,
    /// Chrome 110+ shuffles extension order per connection.
    pub permute_extensions: bool,
    pub ocsp_stapling: bool,
    pub signed_cert_timestamps: bool,
    pub h2: Http2Settings,
}

const CHROME_H2: Http2Settings = Http2Settings {
    header_table_size: 65_536,
    enable_push: false,
    max_concurrent_streams: None,
    initial_window_size: 6_291_456,
    initial_connection_window_size: 15_728_640,
    max_frame_size: 16_384,
};

const CHROME: BrowserFingerprint = BrowserFingerprint {
    cipher_list: CHROME_CIPHERS,
    curves: "X25519:P-256:P-384",
    sigalgs: CHROME_SIGALGS,
    grease: true,
    permute_extensions: true,
    ocsp_stapling: true,
    signed_cert_timestamps: true,
    h2: CHROME_H2,
};

const FIREFOX: BrowserFingerprint = BrowserFingerprint {
    cipher_list: FIREFOX_CIPHERS,
    curves: "X25519:P-256:P-384:P-521",
    sigalgs: FIREFOX_SIGALGS,
    grease: false,
    permute_extensions: false,
    ocsp_stapling: true,
    signed_cert_timestamps: false,
    h2: Http2Settings {
        header_table_size: 65_536,
        enable_push: false,
        max_concurrent_streams: None,
        initial_window_size: 131_072,
        initial_connection_window_size: 12_582_912,
        max_frame_size: 16_384,
    },
};

const SAFARI: BrowserFingerprint = BrowserFingerprint {
    cipher_list: SAFARI_CIPHERS,
    curves: "X25519:P-256:P-384:P-521",
    sigalgs: SAFARI_SIGALGS,
    grease: true,
    permute_extensions: false,
    ocsp_stapling: true,
    signed_cert_timestamps: true,
    h2: Http2Settings {
        header_table_size: 4_096,
        enable_push: false,
        max_concurrent_streams: Some(100),
        initial_window_size: 2_097_152,
        initial_connection_window_size: 10_485_760,
        max_frame_size: 16_384,
    },
};

/// Looks up the handshake shape for a profile, resolving auto aliases first.
pub fn lookup(profile: ProfileId) -> &'static BrowserFingerprint {
    match profile.resolve() {
        ProfileId::Chrome120 | ProfileId::Chrome131 | ProfileId::Edge131 => &CHROME,
        ProfileId::Firefox120 => &FIREFOX,
        ProfileId::Safari17 => &SAFARI,
        // resolve() never yields an alias
        ProfileId::ChromeAuto | ProfileId::EdgeAuto => &CHROME,
        ProfileId::FirefoxAuto => &FIREFOX,
        ProfileId::SafariAuto => &SAFARI,
    }
}
