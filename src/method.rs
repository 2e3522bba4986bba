/// A direct method invocation delivered from the service to the device.
#[derive(Debug, Clone)]
pub struct MethodRequest {
    pub method_name: String,
    pub request_id: String,
    pub payload: Vec<u8>,
}

/// The device's response to a [`MethodRequest`], published back on the
/// method-response topic.
#[derive(Debug, Clone)]
pub struct MethodResponse {
    pub status: u32,
    pub request_id: String,
    pub payload: Vec<u8>,
}

impl MethodResponse {
    pub fn new(request_id: impl Into<String>, status: u32, payload: Vec<u8>) -> Self {
        Self {
            status,
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn for_request(request: &MethodRequest, status: u32, payload: Vec<u8>) -> Self {
        Self::new(request.request_id.clone(), status, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_for_request_copies_request_id() {
        let req = MethodRequest {
            method_name: "reboot".into(),
            request_id: "r-1".into(),
            payload: vec![],
        };
        let resp = MethodResponse::for_request(&req, 200, b"{}".to_vec());
        assert_eq!(resp.request_id, "r-1");
        assert_eq!(resp.status, 200);
    }
}
