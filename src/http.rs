//! HTTP vocabulary shared by the parser and the response builder: the two
//! accepted methods, the request-level status codes, and the closed table of
//! single-character path codes that select canned pages and account actions.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Method names are matched case-insensitively; anything other than GET
    /// or POST is a bad request.
    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("GET") {
            Some(Method::Get)
        } else if token.eq_ignore_ascii_case("POST") {
            Some(Method::Post)
        } else {
            None
        }
    }
}

/// Outcome of advancing the request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// More data is needed before the request is complete.
    NoRequest,
    /// A full request has been buffered and parsed.
    GetRequest,
    /// Malformed request line, header, or target.
    BadRequest,
    /// The resolved file does not exist.
    NoResource,
    /// The resolved file is not world-readable.
    ForbiddenRequest,
    /// A file (possibly empty) is ready to be sent.
    FileRequest,
    /// Unrecoverable state inside the parser.
    InternalError,
}

pub const OK_200_TITLE: &str = "OK";
pub const ERROR_400_TITLE: &str = "Bad Request";
pub const ERROR_400_FORM: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub const ERROR_403_TITLE: &str = "Forbidden";
pub const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
pub const ERROR_404_TITLE: &str = "Not Found";
pub const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
pub const ERROR_500_TITLE: &str = "Internal Error";
pub const ERROR_500_FORM: &str = "There was an unusual problem serving the request file.\n";

/// Body used for a zero-length file, which is never memory-mapped.
pub const EMPTY_FILE_BODY: &str = "<html><body></body></html>";

/// A bare `/` target expands to the landing page.
pub const DEFAULT_LANDING: &str = "/judge.html";

pub const LOGIN_OK_PAGE: &str = "/welcome.html";
pub const LOGIN_FAIL_PAGE: &str = "/logError.html";
pub const REGISTER_OK_PAGE: &str = "/log.html";
pub const REGISTER_FAIL_PAGE: &str = "/registerError.html";

/// Path codes `2` and `3` are POST-only account actions (login-check and
/// register-check); the rest map straight to canned static pages. The table
/// is closed: it is not extensible at the protocol level.
pub const LOGIN_CHECK_CODE: u8 = b'2';
pub const REGISTER_CHECK_CODE: u8 = b'3';

pub fn canned_page(code: u8) -> Option<&'static str> {
    match code {
        b'0' => Some("/register.html"),
        b'1' => Some("/log.html"),
        b'5' => Some("/picture.html"),
        b'6' => Some("/video.html"),
        b'7' => Some("/fans.html"),
        _ => None,
    }
}

/// The single-character path code is the byte following the last `/` of the
/// request target.
pub fn path_code(target: &str) -> Option<u8> {
    let idx = target.rfind('/')?;
    target.as_bytes().get(idx + 1).copied()
}

pub fn status_title(status: u16) -> &'static str {
    match status {
        200 => OK_200_TITLE,
        400 => ERROR_400_TITLE,
        403 => ERROR_403_TITLE,
        404 => ERROR_404_TITLE,
        _ => ERROR_500_TITLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_matching() {
        assert_eq!(Method::from_token("GET"), Some(Method::Get));
        assert_eq!(Method::from_token("get"), Some(Method::Get));
        assert_eq!(Method::from_token("POST"), Some(Method::Post));
        assert_eq!(Method::from_token("PUT"), None);
        assert_eq!(Method::from_token("HEAD"), None);
    }

    #[test]
    fn test_path_codes() {
        assert_eq!(path_code("/0"), Some(b'0'));
        assert_eq!(path_code("/2CGISQL.cgi"), Some(b'2'));
        assert_eq!(path_code("/judge.html"), Some(b'j'));
        assert_eq!(path_code("/"), None);
        assert_eq!(canned_page(b'5'), Some("/picture.html"));
        assert_eq!(canned_page(b'2'), None);
    }
}
